use chrono::{DateTime, TimeZone, Utc};

use fleetlink_recon::model::{GeoPoint, LinkMethod, LocationUpdate, MappingUpsert, MatchReason};
use fleetlink_recon::{
    CancelToken, DeviceFeed, DeviceRecord, FeedError, InMemoryRepository, ManualEntry,
    MappingRepository, ReconConfig, ReconError, Reconciler, RepositoryError, RunControl,
    StaticFeed, SyncMode, VehicleRecord,
};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
}

fn device(tracker: &str, plate: &str, hour: u32) -> DeviceRecord {
    DeviceRecord {
        tracker_id: tracker.into(),
        raw_plate: plate.into(),
        location: Some(GeoPoint::new(24.71, 46.67)),
        address: Some("Olaya St".into()),
        reported_at: at(hour),
    }
}

fn fleet() -> Vec<VehicleRecord> {
    vec![
        VehicleRecord::new("V1", "ABJ123"),
        VehicleRecord::new("V2", "ABJ128"),
        VehicleRecord::new("V3", "XKD 4471"),
        VehicleRecord::new("V4", "GHR 902"),
    ]
}

fn control_at(hour: u32) -> RunControl {
    RunControl {
        started_at: Some(at(hour)),
        ..RunControl::default()
    }
}

fn run_auto(devices: Vec<DeviceRecord>, repo: &mut InMemoryRepository) -> fleetlink_recon::SyncSummary {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut feed = StaticFeed::new(devices);
    engine.run_auto(&mut feed, repo, &control_at(12)).unwrap()
}

/// Wraps a repository and fails writes touching `bad_vehicle`.
struct FlakyRepository {
    inner: InMemoryRepository,
    bad_vehicle: &'static str,
    fail_locations: bool,
}

impl MappingRepository for FlakyRepository {
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError> {
        if vehicle_id == self.bad_vehicle {
            return Err(RepositoryError::Storage("disk I/O error".into()));
        }
        self.inner.upsert_mapping(tracker_id, vehicle_id, method, linked_at)
    }

    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError> {
        if self.fail_locations && vehicle_id == self.bad_vehicle {
            return Err(RepositoryError::Timeout("location write".into()));
        }
        self.inner.update_vehicle_location(vehicle_id, update)
    }

    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError> {
        self.inner.vehicle_owner(vehicle_id)
    }
}

/// Cancels the run once the first mapping lands.
struct CancellingRepository {
    inner: InMemoryRepository,
    token: CancelToken,
}

impl MappingRepository for CancellingRepository {
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError> {
        self.token.cancel();
        self.inner.upsert_mapping(tracker_id, vehicle_id, method, linked_at)
    }

    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError> {
        self.inner.update_vehicle_location(vehicle_id, update)
    }

    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError> {
        self.inner.vehicle_owner(vehicle_id)
    }
}

struct DownFeed;

impl DeviceFeed for DownFeed {
    fn discover(&mut self) -> Result<Vec<DeviceRecord>, FeedError> {
        Err(FeedError::Timeout { secs: 15 })
    }
}

// -------------------------------------------------------------------------
// Automatic mode
// -------------------------------------------------------------------------

#[test]
fn arabic_plate_links_exactly() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(vec![device("T1", "أ ب ج-123", 10)], &mut repo);

    assert_eq!(summary.mode, SyncMode::Auto);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.upserted_mappings, 1);
    assert_eq!(summary.updated_vehicles, 1);
    assert_eq!(summary.updated_locations, 1);
    assert_eq!(summary.skipped, 0);
    assert!(summary.errors.is_empty());

    let mapping = repo.active_for_tracker("T1").unwrap();
    assert_eq!(mapping.vehicle_id, "V1");
    assert_eq!(mapping.link_method, LinkMethod::Auto);
    assert_eq!(mapping.linked_at, at(12));
    assert_eq!(repo.location("V1").unwrap().address.as_deref(), Some("Olaya St"));
}

#[test]
fn repeated_run_creates_nothing_new() {
    let mut repo = InMemoryRepository::new();
    let devices = vec![device("T1", "ABJ123", 10), device("T3", "xkd-4471", 10)];
    let first = run_auto(devices.clone(), &mut repo);
    let second = run_auto(devices, &mut repo);

    assert_eq!(first.upserted_mappings, 2);
    assert_eq!(second.upserted_mappings, 0);
    assert_eq!(second.matched, first.matched);
    assert_eq!(repo.history().len(), 2);
}

#[test]
fn near_tie_is_suggested_not_applied() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(vec![device("T9", "ABJ129", 10)], &mut repo);

    assert_eq!(summary.matched, 0);
    assert_eq!(summary.upserted_mappings, 0);
    assert_eq!(summary.unmatched_suggestions.len(), 1);

    let suggestion = &summary.unmatched_suggestions[0];
    assert_eq!(suggestion.tracker_id, "T9");
    assert_eq!(suggestion.normalized_plate, "ABJ129");
    let ids: Vec<_> = suggestion
        .top_candidates
        .iter()
        .map(|c| c.vehicle_id.as_str())
        .collect();
    assert_eq!(ids, vec!["V1", "V2"]);
    for c in &suggestion.top_candidates {
        assert_eq!(c.reason, MatchReason::FuzzyMatch);
        assert!((c.score - 5.0 / 6.0).abs() < 1e-6);
    }
    assert!(repo.history().is_empty());
}

#[test]
fn failing_device_is_isolated() {
    let mut repo = FlakyRepository {
        inner: InMemoryRepository::new(),
        bad_vehicle: "V3",
        fail_locations: true,
    };
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut feed = StaticFeed::new(vec![
        device("T1", "ABJ123", 10),
        device("T3", "XKD4471", 10),
        device("T4", "GHR902", 10),
    ]);
    let summary = engine.run_auto(&mut feed, &mut repo, &control_at(12)).unwrap();

    assert_eq!(summary.matched, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errors.len(), 1);
    let error = &summary.errors[0];
    assert!(error.starts_with("T3 (XKD4471): "), "{error}");
    assert!(error.contains("mapping: storage error: disk I/O error"));
    assert!(error.contains("location: "));
    assert!(repo.inner.active_for_tracker("T4").is_some());
}

#[test]
fn location_lands_even_when_mapping_fails() {
    let mut repo = FlakyRepository {
        inner: InMemoryRepository::new(),
        bad_vehicle: "V1",
        fail_locations: false,
    };
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut feed = StaticFeed::new(vec![device("T1", "ABJ123", 10)]);
    let summary = engine.run_auto(&mut feed, &mut repo, &control_at(12)).unwrap();

    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.upserted_mappings, 0);
    assert_eq!(summary.updated_locations, 1);
    assert_eq!(summary.updated_vehicles, 1);
    assert!(repo.inner.location("V1").is_some());
}

#[test]
fn stale_location_is_not_written() {
    let mut repo = InMemoryRepository::new();
    run_auto(vec![device("T1", "ABJ123", 10)], &mut repo);

    let mut stale = device("T1", "ABJ123", 8);
    stale.location = Some(GeoPoint::new(21.5, 39.2));
    let summary = run_auto(vec![stale], &mut repo);

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.updated_locations, 0);
    assert_eq!(summary.updated_vehicles, 0);
    let stored = repo.location("V1").unwrap();
    assert_eq!(stored.observed_at, at(10));
    assert_eq!(stored.point.latitude, 24.71);
}

#[test]
fn missing_tracker_and_unknown_plate_are_skipped() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(
        vec![device("", "ABJ123", 10), device("T7", "ZZZ", 10)],
        &mut repo,
    );
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.matched, 0);
    assert!(summary.errors.is_empty());
}

#[test]
fn duplicate_tracker_is_skipped() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(
        vec![device("T1", "ABJ123", 10), device("T1", "GHR902", 10)],
        &mut repo,
    );
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(repo.active_for_tracker("T1").unwrap().vehicle_id, "V1");
}

#[test]
fn vehicle_claimed_twice_in_one_run_is_demoted() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(
        vec![device("T1", "ABJ123", 10), device("T2", "ABJ 123", 10)],
        &mut repo,
    );
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.unmatched_suggestions.len(), 1);
    assert_eq!(summary.unmatched_suggestions[0].tracker_id, "T2");
    assert_eq!(repo.active_for_vehicle("V1").unwrap().tracker_id, "T1");
}

#[test]
fn vehicle_linked_to_another_tracker_is_left_for_review() {
    let mut repo = InMemoryRepository::new();
    run_auto(vec![device("T1", "ABJ123", 10)], &mut repo);

    // The newcomer comes first in the batch; the established link still holds.
    let summary = run_auto(
        vec![device("T2", "ABJ123", 11), device("T1", "ABJ123", 11)],
        &mut repo,
    );
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.upserted_mappings, 0);
    assert_eq!(summary.unmatched_suggestions.len(), 1);
    assert_eq!(summary.unmatched_suggestions[0].tracker_id, "T2");
    assert_eq!(summary.unmatched_suggestions[0].top_candidates[0].vehicle_id, "V1");
    assert_eq!(repo.active_for_vehicle("V1").unwrap().tracker_id, "T1");
    assert_eq!(repo.history().len(), 1);
}

#[test]
fn demoted_suggestion_respects_floor() {
    let mut config = ReconConfig::default();
    config.policy.suggestion_floor = 0.9;
    let engine = Reconciler::new(config, &fleet());
    let mut repo = InMemoryRepository::new();
    repo.upsert_mapping("T1", "V1", LinkMethod::Auto, at(9)).unwrap();

    // ABJ123 also scores ~0.83 against V2, below the raised floor.
    let mut feed = StaticFeed::new(vec![device("T2", "ABJ123", 10)]);
    let summary = engine.run_auto(&mut feed, &mut repo, &control_at(12)).unwrap();

    let top = &summary.unmatched_suggestions[0].top_candidates;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].vehicle_id, "V1");
}

#[test]
fn discovered_sample_is_bounded() {
    let mut config = ReconConfig::default();
    config.run.discovered_sample = 2;
    let engine = Reconciler::new(config, &fleet());
    let mut feed = StaticFeed::new(vec![
        device("T1", "ABJ123", 10),
        device("T2", "QQQ1", 10),
        device("T3", "QQQ2", 10),
    ]);
    let mut repo = InMemoryRepository::new();
    let summary = engine.run_auto(&mut feed, &mut repo, &control_at(12)).unwrap();

    assert_eq!(summary.discovered_devices.len(), 2);
    assert_eq!(summary.discovered_devices[0].tracker_id, "T1");
    assert_eq!(summary.discovered_devices[1].plate, "QQQ1");
}

#[test]
fn feed_failure_fails_the_run() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    let err = engine
        .run_auto(&mut DownFeed, &mut repo, &RunControl::default())
        .unwrap_err();
    assert!(matches!(err, ReconError::Feed(FeedError::Timeout { secs: 15 })));
    assert!(repo.history().is_empty());
}

#[test]
fn cancellation_keeps_applied_work() {
    let control = RunControl::default();
    let mut repo = CancellingRepository {
        inner: InMemoryRepository::new(),
        token: control.cancel.clone(),
    };
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut feed = StaticFeed::new(vec![device("T1", "ABJ123", 10), device("T4", "GHR902", 10)]);
    let summary = engine.run_auto(&mut feed, &mut repo, &control).unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.matched, 1);
    assert_eq!(repo.inner.active_mappings().len(), 1);
    assert!(repo.inner.active_for_tracker("T4").is_none());
}

#[test]
fn summary_serializes_camel_case() {
    let mut repo = InMemoryRepository::new();
    let summary = run_auto(vec![device("T9", "ABJ129", 10)], &mut repo);
    let json = serde_json::to_value(&summary).unwrap();

    assert_eq!(json["mode"], "auto");
    assert_eq!(json["upsertedMappings"], 0);
    assert_eq!(json["unmatchedSuggestions"][0]["trackerId"], "T9");
    assert_eq!(json["unmatchedSuggestions"][0]["topCandidates"][0]["reason"], "fuzzy_match");
    assert_eq!(json["discoveredDevices"][0]["trackerId"], "T9");
    assert!(json.get("cancelled").is_none());
}

// -------------------------------------------------------------------------
// Manual mode
// -------------------------------------------------------------------------

fn manual(plate: &str, tracker: &str) -> ManualEntry {
    ManualEntry {
        plate: plate.into(),
        tracker_id: tracker.into(),
        ..ManualEntry::default()
    }
}

#[test]
fn manual_exact_pair_links_as_manual() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    let mut entry = manual("abj 123", "T1");
    entry.latitude = Some(24.7);
    entry.longitude = Some(46.6);
    let summary = engine
        .run_manual(&[entry], &mut repo, &control_at(14))
        .unwrap();

    assert_eq!(summary.mode, SyncMode::Manual);
    assert_eq!(summary.matched, 1);
    let mapping = repo.active_for_tracker("T1").unwrap();
    assert_eq!(mapping.link_method, LinkMethod::Manual);
    assert_eq!(repo.location("V1").unwrap().observed_at, at(14));
}

#[test]
fn manual_relink_supersedes_previous_tracker() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    engine
        .run_manual(&[manual("ABJ123", "T1")], &mut repo, &control_at(14))
        .unwrap();
    let summary = engine
        .run_manual(&[manual("ABJ123", "T5")], &mut repo, &control_at(15))
        .unwrap();

    assert_eq!(summary.upserted_mappings, 1);
    assert_eq!(repo.history().len(), 2);
    assert_eq!(repo.history()[0].closed_at, Some(at(15)));
    assert_eq!(repo.active_for_vehicle("V1").unwrap().tracker_id, "T5");
}

#[test]
fn manual_incomplete_pair_is_skipped() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    let summary = engine
        .run_manual(&[manual("ABJ123", ""), manual("", "T2")], &mut repo, &control_at(14))
        .unwrap();
    assert_eq!(summary.skipped, 2);
    assert!(repo.history().is_empty());
}

#[test]
fn manual_invalid_entry_rejects_whole_batch() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    let mut bad = manual("GHR902", "T4");
    bad.longitude = Some(46.6);
    let err = engine
        .run_manual(&[manual("ABJ123", "T1"), bad], &mut repo, &control_at(14))
        .unwrap_err();

    assert!(matches!(err, ReconError::Validation { index: 1, .. }));
    assert!(repo.history().is_empty());
}

#[test]
fn manual_non_exact_follows_thresholds() {
    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let mut repo = InMemoryRepository::new();
    let summary = engine
        .run_manual(&[manual("KSA GHR 902", "T4")], &mut repo, &control_at(14))
        .unwrap();

    assert_eq!(summary.matched, 0);
    let top = &summary.unmatched_suggestions[0].top_candidates[0];
    assert_eq!(top.vehicle_id, "V4");
    assert_eq!(top.reason, MatchReason::PrefixVariant);
}

#[test]
fn manual_entry_can_take_over_a_linked_vehicle() {
    let mut repo = InMemoryRepository::new();
    run_auto(vec![device("T1", "ABJ123", 10)], &mut repo);

    let engine = Reconciler::new(ReconConfig::default(), &fleet());
    let summary = engine
        .run_manual(&[manual("ABJ123", "T2")], &mut repo, &control_at(13))
        .unwrap();

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.upserted_mappings, 1);
    let mapping = repo.active_for_vehicle("V1").unwrap();
    assert_eq!(mapping.tracker_id, "T2");
    assert_eq!(mapping.link_method, LinkMethod::Manual);
    assert!(repo.active_for_tracker("T1").is_none());
}
