use std::collections::BTreeSet;

use crate::model::{AppliedWrites, DeviceOutcome, DiscoveredDevice, SyncMode, SyncSummary};

/// Fold per-device outcomes into run counters.
///
/// Writes that landed before a device errored still count toward
/// `upserted_mappings` / `updated_locations`, so the counters agree with
/// the store.
pub fn build_summary(
    mode: SyncMode,
    outcomes: &[DeviceOutcome],
    discovered: Vec<DiscoveredDevice>,
) -> SyncSummary {
    let mut summary = SyncSummary {
        mode,
        matched: 0,
        updated_vehicles: 0,
        upserted_mappings: 0,
        updated_locations: 0,
        skipped: 0,
        errors: Vec::new(),
        unmatched_suggestions: Vec::new(),
        discovered_devices: discovered,
        cancelled: false,
    };
    let mut touched: BTreeSet<&str> = BTreeSet::new();

    for outcome in outcomes {
        match outcome {
            DeviceOutcome::Mapped { vehicle_id, applied, .. } => {
                summary.matched += 1;
                count_writes(&mut summary, &mut touched, vehicle_id, applied);
            }
            DeviceOutcome::Suggested(suggestion) => {
                summary.unmatched_suggestions.push(suggestion.clone());
            }
            DeviceOutcome::Skipped { .. } => {
                summary.skipped += 1;
            }
            DeviceOutcome::Errored {
                tracker_id,
                plate,
                vehicle_id,
                message,
                applied,
            } => {
                summary.skipped += 1;
                summary.errors.push(format!("{tracker_id} ({plate}): {message}"));
                if let Some(vehicle_id) = vehicle_id {
                    count_writes(&mut summary, &mut touched, vehicle_id, applied);
                }
            }
        }
    }

    summary.updated_vehicles = touched.len();
    summary
}

fn count_writes<'a>(
    summary: &mut SyncSummary,
    touched: &mut BTreeSet<&'a str>,
    vehicle_id: &'a str,
    applied: &AppliedWrites,
) {
    summary.upserted_mappings += usize::from(applied.mapping_created);
    summary.updated_locations += usize::from(applied.location_updated);
    if applied.touched_vehicle() {
        touched.insert(vehicle_id);
    }
}
