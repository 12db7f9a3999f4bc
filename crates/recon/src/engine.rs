use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::config::ReconConfig;
use crate::decision::{above_floor, decide, Decision, DecisionMode};
use crate::error::ReconError;
use crate::matcher::PlateIndex;
use crate::model::{
    AppliedWrites, DeviceOutcome, DeviceRecord, DiscoveredDevice, GeoPoint, LinkMethod,
    LocationUpdate, ManualEntry, MatchCandidate, MatchSuggestion, SkipReason, SyncMode,
    SyncSummary, VehicleRecord,
};
use crate::normalize::{NormalizedPlate, Normalizer};
use crate::port::{DeviceFeed, MappingRepository};
use crate::summary::build_summary;

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

/// Shared cancellation flag. Checked between devices; applied mappings stay.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancelToken,
    /// Run clock. Stamps `linked_at` and manual-entry observations.
    /// Defaults to the wall clock at run start.
    pub started_at: Option<DateTime<Utc>>,
}

/// Per-run accumulator. Nothing outlives a run.
struct RunState {
    started_at: DateTime<Utc>,
    seen_trackers: HashSet<String>,
    claimed_vehicles: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Drives one reconciliation run against a fixed vehicle set.
pub struct Reconciler {
    config: ReconConfig,
    normalizer: Normalizer,
    index: PlateIndex,
}

impl Reconciler {
    pub fn new(config: ReconConfig, vehicles: &[VehicleRecord]) -> Self {
        let normalizer = Normalizer::from_config(&config.normalizer);
        let index = PlateIndex::build(vehicles, &normalizer, &config.normalizer.region_tokens);
        Self {
            config,
            normalizer,
            index,
        }
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// Automatic mode: discover devices from `feed`, then reconcile.
    /// A feed failure fails the whole run.
    pub fn run_auto<F, R>(
        &self,
        feed: &mut F,
        repo: &mut R,
        control: &RunControl,
    ) -> Result<SyncSummary, ReconError>
    where
        F: DeviceFeed + ?Sized,
        R: MappingRepository + ?Sized,
    {
        let devices = feed.discover().map_err(|e| {
            warn!("device discovery failed: {e}");
            ReconError::Feed(e)
        })?;
        info!("discovered {} devices", devices.len());
        Ok(self.run_devices(SyncMode::Auto, &devices, repo, control))
    }

    /// Manual mode: validate every entry up front, then reconcile them in order.
    pub fn run_manual<R>(
        &self,
        entries: &[ManualEntry],
        repo: &mut R,
        control: &RunControl,
    ) -> Result<SyncSummary, ReconError>
    where
        R: MappingRepository + ?Sized,
    {
        validate_manual_entries(entries)?;
        let observed_at = control.started_at.unwrap_or_else(Utc::now);
        let devices = manual_devices(entries, observed_at);
        Ok(self.run_devices(SyncMode::Manual, &devices, repo, control))
    }

    /// Shared pipeline: normalize → match → decide → apply, one device at a time.
    pub fn run_devices<R>(
        &self,
        mode: SyncMode,
        devices: &[DeviceRecord],
        repo: &mut R,
        control: &RunControl,
    ) -> SyncSummary
    where
        R: MappingRepository + ?Sized,
    {
        let mut state = RunState {
            started_at: control.started_at.unwrap_or_else(Utc::now),
            seen_trackers: HashSet::new(),
            claimed_vehicles: HashMap::new(),
        };
        info!(
            "{} run '{}': {} devices against {} vehicles",
            mode,
            self.config.name,
            devices.len(),
            self.index.len()
        );

        let discovered: Vec<DiscoveredDevice> = devices
            .iter()
            .take(self.config.run.discovered_sample)
            .map(|d| DiscoveredDevice {
                plate: d.raw_plate.clone(),
                tracker_id: d.tracker_id.clone(),
            })
            .collect();

        let mut outcomes = Vec::with_capacity(devices.len());
        let mut cancelled = false;
        for device in devices {
            if control.cancel.is_cancelled() {
                warn!(
                    "run cancelled after {} of {} devices",
                    outcomes.len(),
                    devices.len()
                );
                cancelled = true;
                break;
            }
            outcomes.push(self.process_device(mode, device, &mut state, repo));
        }

        let mut summary = build_summary(mode, &outcomes, discovered);
        summary.cancelled = cancelled;
        info!(
            "{} run done: {} matched, {} new mappings, {} locations, {} suggestions, {} skipped, {} errors",
            mode,
            summary.matched,
            summary.upserted_mappings,
            summary.updated_locations,
            summary.unmatched_suggestions.len(),
            summary.skipped,
            summary.errors.len()
        );
        summary
    }

    fn process_device<R>(
        &self,
        mode: SyncMode,
        device: &DeviceRecord,
        state: &mut RunState,
        repo: &mut R,
    ) -> DeviceOutcome
    where
        R: MappingRepository + ?Sized,
    {
        let tracker_id = device.tracker_id.trim();
        let decision_mode = match mode {
            SyncMode::Auto => {
                if tracker_id.is_empty() {
                    return skipped(tracker_id, SkipReason::MissingTrackerId);
                }
                DecisionMode::Auto
            }
            SyncMode::Manual => DecisionMode::Manual {
                pair_complete: !tracker_id.is_empty() && !device.raw_plate.trim().is_empty(),
            },
        };

        if !tracker_id.is_empty() && !state.seen_trackers.insert(tracker_id.to_string()) {
            warn!("tracker {tracker_id} appears more than once in this batch");
            return skipped(tracker_id, SkipReason::DuplicateTracker);
        }

        let normalized = self.normalizer.normalize(&device.raw_plate);
        let candidates = self.index.candidates(&normalized, &self.config.matching);

        match decide(&candidates, decision_mode, &self.config.policy) {
            Decision::Skip(reason) => {
                debug!("{tracker_id} '{}': skipped ({reason})", device.raw_plate);
                skipped(tracker_id, reason)
            }
            Decision::Suggest(top) => {
                debug!(
                    "{tracker_id} '{}': {} candidates below the auto-apply bar",
                    device.raw_plate,
                    top.len()
                );
                suggestion(tracker_id, &normalized, top)
            }
            Decision::AutoApply { candidate, method } => {
                if let Some(owner) = state.claimed_vehicles.get(&candidate.vehicle_id) {
                    warn!(
                        "{tracker_id}: vehicle {} already claimed by {owner} in this run",
                        candidate.vehicle_id
                    );
                    return suggestion(
                        tracker_id,
                        &normalized,
                        above_floor(&candidates, &self.config.policy),
                    );
                }

                // Taking a vehicle away from another tracker needs an operator.
                if mode == SyncMode::Auto {
                    match repo.vehicle_owner(&candidate.vehicle_id) {
                        Ok(Some(owner)) if owner != tracker_id => {
                            warn!(
                                "{tracker_id}: vehicle {} is linked to {owner}; leaving it for review",
                                candidate.vehicle_id
                            );
                            return suggestion(
                                tracker_id,
                                &normalized,
                                above_floor(&candidates, &self.config.policy),
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let message = format!("owner lookup: {e}");
                            warn!("{tracker_id} '{}': {message}", device.raw_plate);
                            return DeviceOutcome::Errored {
                                tracker_id: tracker_id.to_string(),
                                plate: device.raw_plate.clone(),
                                vehicle_id: Some(candidate.vehicle_id),
                                message,
                                applied: AppliedWrites::default(),
                            };
                        }
                    }
                }
                self.apply(tracker_id, device, candidate, method, state, repo)
            }
        }
    }

    /// Write mapping then location. Each write is attempted even if the
    /// other failed; any failure turns the device into an error.
    fn apply<R>(
        &self,
        tracker_id: &str,
        device: &DeviceRecord,
        candidate: MatchCandidate,
        method: LinkMethod,
        state: &mut RunState,
        repo: &mut R,
    ) -> DeviceOutcome
    where
        R: MappingRepository + ?Sized,
    {
        let vehicle_id = candidate.vehicle_id;
        let mut applied = AppliedWrites::default();
        let mut failures = Vec::new();

        match repo.upsert_mapping(tracker_id, &vehicle_id, method, state.started_at) {
            Ok(upsert) => {
                applied.mapping_created = upsert.created;
                if upsert.superseded > 0 {
                    info!(
                        "{tracker_id} -> {vehicle_id}: closed {} earlier mapping(s)",
                        upsert.superseded
                    );
                }
                state
                    .claimed_vehicles
                    .insert(vehicle_id.clone(), tracker_id.to_string());
            }
            Err(e) => failures.push(format!("mapping: {e}")),
        }

        if let Some(point) = device.location {
            let update = LocationUpdate {
                point,
                address: device.address.clone(),
                observed_at: device.reported_at,
            };
            match repo.update_vehicle_location(&vehicle_id, &update) {
                Ok(written) => applied.location_updated = written,
                Err(e) => failures.push(format!("location: {e}")),
            }
        }

        if failures.is_empty() {
            debug!(
                "{tracker_id} -> {vehicle_id} ({method}, {}, score {:.3})",
                candidate.reason, candidate.score
            );
            DeviceOutcome::Mapped {
                tracker_id: tracker_id.to_string(),
                vehicle_id,
                method,
                applied,
            }
        } else {
            let message = failures.join("; ");
            warn!("{tracker_id} '{}': {message}", device.raw_plate);
            DeviceOutcome::Errored {
                tracker_id: tracker_id.to_string(),
                plate: device.raw_plate.clone(),
                vehicle_id: Some(vehicle_id),
                message,
                applied,
            }
        }
    }
}

fn skipped(tracker_id: &str, reason: SkipReason) -> DeviceOutcome {
    DeviceOutcome::Skipped {
        tracker_id: tracker_id.to_string(),
        reason,
    }
}

fn suggestion(tracker_id: &str, plate: &NormalizedPlate, top: Vec<MatchCandidate>) -> DeviceOutcome {
    DeviceOutcome::Suggested(MatchSuggestion {
        tracker_id: tracker_id.to_string(),
        device_plate: plate.source_plate.clone(),
        normalized_plate: plate.value.clone(),
        top_candidates: top,
    })
}

// ---------------------------------------------------------------------------
// Manual input
// ---------------------------------------------------------------------------

/// Reject malformed manual entries before any device is processed.
pub fn validate_manual_entries(entries: &[ManualEntry]) -> Result<(), ReconError> {
    for (index, entry) in entries.iter().enumerate() {
        let invalid = |message: &str| ReconError::Validation {
            index,
            message: message.to_string(),
        };

        if entry.plate.trim().is_empty() && entry.tracker_id.trim().is_empty() {
            return Err(invalid("both plate and trackerId are missing"));
        }

        match (entry.latitude, entry.longitude) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(invalid("latitude and longitude must be given together"));
            }
            (Some(lat), Some(lon)) if !GeoPoint::new(lat, lon).in_range() => {
                return Err(invalid("coordinates out of range"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Turn validated manual entries into device records observed at `observed_at`.
pub fn manual_devices(entries: &[ManualEntry], observed_at: DateTime<Utc>) -> Vec<DeviceRecord> {
    entries
        .iter()
        .map(|e| DeviceRecord {
            tracker_id: e.tracker_id.trim().to_string(),
            raw_plate: e.plate.clone(),
            location: GeoPoint::from_parts(e.latitude, e.longitude),
            address: e.address.clone().filter(|a| !a.trim().is_empty()),
            reported_at: observed_at,
        })
        .collect()
}
