// Binary-level tests for `fleetlink`.
// Run with: cargo test -p fleetlink-cli --test cli_tests

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use chrono::{Duration, Utc};
use httpmock::prelude::*;
use tempfile::TempDir;

use fleetlink_store::{SqliteStore, StoreOptions};

fn fleetlink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fleetlink"));
    cmd.current_dir(env!("CARGO_MANIFEST_DIR"));
    // Keep a real token out of tests
    cmd.env_remove("FLEETLINK_FEED_TOKEN");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn run(args: &[&str]) -> Output {
    fleetlink().args(args).output().expect("failed to run fleetlink")
}

fn assert_exit(output: &Output, code: i32) {
    assert_eq!(
        output.status.code(),
        Some(code),
        "expected exit {code}, got {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Temp dir with `fleet.db` seeded from a small vehicles CSV.
fn seeded_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let csv = write(
        &dir,
        "vehicles.csv",
        "vehicle_id,plate_number,active\nV1,ABJ123,true\nV2,ABJ128,true\nV3,XKD 4471,true\nV9,OLD1,false\n",
    );
    let db = dir.path().join("fleet.db");
    let out = run(&["vehicles", "import", "--db", s(&db), s(&csv)]);
    assert_exit(&out, 0);
    (dir, db)
}

const DEVICES: &str = r#"{"devices": [
    {"trackerId": "T1", "plate": "أ ب ج-123", "lat": 24.71, "lng": 46.67, "timestamp": "2026-03-01T10:00:00Z"},
    {"trackerId": "T9", "plate": "ABJ129"},
    {"imei": 777, "plateNumber": "zzz"}
]}"#;

fn json_stdout(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn auto_sync_from_file_reports_json() {
    let (dir, db) = seeded_db();
    let feed = write(&dir, "devices.json", DEVICES);

    let out = run(&["sync", "auto", "--db", s(&db), "--feed-file", s(&feed), "--json"]);
    assert_exit(&out, 0);

    let summary = json_stdout(&out);
    assert_eq!(summary["mode"], "auto");
    assert_eq!(summary["matched"], 1);
    assert_eq!(summary["upsertedMappings"], 1);
    assert_eq!(summary["updatedVehicles"], 1);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["unmatchedSuggestions"][0]["trackerId"], "T9");
    assert_eq!(summary["discoveredDevices"].as_array().unwrap().len(), 3);

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("auto sync: 1 matched"), "stderr: {stderr}");

    // Second run: nothing new.
    let again = run(&["sync", "auto", "--db", s(&db), "--feed-file", s(&feed), "--json"]);
    assert_exit(&again, 0);
    assert_eq!(json_stdout(&again)["upsertedMappings"], 0);
}

#[test]
fn output_file_and_mappings_listing() {
    let (dir, db) = seeded_db();
    let feed = write(&dir, "devices.json", DEVICES);
    let summary_path = dir.path().join("summary.json");

    let out = run(&[
        "sync", "auto", "--db", s(&db), "--feed-file", s(&feed), "--output", s(&summary_path),
    ]);
    assert_exit(&out, 0);
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(written["matched"], 1);

    let out = run(&["mappings", "--db", s(&db), "--json"]);
    assert_exit(&out, 0);
    let mappings = json_stdout(&out);
    assert_eq!(mappings.as_array().unwrap().len(), 1);
    assert_eq!(mappings[0]["vehicleId"], "V1");
    assert_eq!(mappings[0]["linkMethod"], "auto");
}

#[test]
fn manual_sync_links_exact_pair() {
    let (dir, db) = seeded_db();
    let entries = write(
        &dir,
        "entries.json",
        r#"[{"plate": "XKD-4471", "trackerId": "T3", "latitude": 21.5, "longitude": 39.2}]"#,
    );

    let out = run(&["sync", "manual", "--db", s(&db), "--entries", s(&entries), "--json"]);
    assert_exit(&out, 0);
    assert_eq!(json_stdout(&out)["matched"], 1);

    let out = run(&["mappings", "--db", s(&db), "--tracker", "T3"]);
    assert_exit(&out, 0);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("T3\tV3\tmanual"), "stdout: {stdout}");

    let out = run(&["vehicles", "list", "--db", s(&db), "--json"]);
    assert_exit(&out, 0);
    let vehicles = json_stdout(&out);
    let v3 = vehicles
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["vehicleId"] == "V3")
        .unwrap();
    assert_eq!(v3["latitude"], 21.5);
    assert_eq!(v3["normalizedPlate"], "XKD4471");
}

#[test]
fn invalid_manual_entry_exits_4() {
    let (dir, db) = seeded_db();
    let entries = write(
        &dir,
        "entries.json",
        r#"[{"plate": "ABJ123", "trackerId": "T1"}, {"plate": "", "trackerId": ""}]"#,
    );

    let out = run(&["sync", "manual", "--db", s(&db), "--entries", s(&entries)]);
    assert_exit(&out, 4);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("entry 1"), "stderr: {stderr}");

    let out = run(&["mappings", "--db", s(&db), "--json"]);
    assert_eq!(json_stdout(&out).as_array().unwrap().len(), 0);
}

#[test]
fn missing_feed_exits_2() {
    let (_dir, db) = seeded_db();
    let out = run(&["sync", "auto", "--db", s(&db)]);
    assert_exit(&out, 2);
    assert!(String::from_utf8_lossy(&out.stderr).contains("no device feed configured"));
}

#[test]
fn feed_auth_failure_exits_5() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/devices");
        then.status(403);
    });

    let (_dir, db) = seeded_db();
    let url = server.url("/api/devices");
    let out = run(&["sync", "auto", "--db", s(&db), "--feed-url", &url, "--token", "bad"]);

    assert_exit(&out, 5);
    mock.assert_calls(1);
}

#[test]
fn http_feed_uses_token_from_env() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/devices")
            .header("authorization", "Bearer from-env");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"[{"trackerId": "T1", "plate": "ABJ 123"}]"#);
    });

    let (_dir, db) = seeded_db();
    let url = server.url("/api/devices");
    let out = fleetlink()
        .env("FLEETLINK_FEED_TOKEN", "from-env")
        .args(["sync", "auto", "--db", s(&db), "--feed-url", &url, "--json"])
        .output()
        .unwrap();

    assert_exit(&out, 0);
    mock.assert();
    assert_eq!(json_stdout(&out)["matched"], 1);
}

#[test]
fn held_run_lock_exits_7() {
    let (dir, db) = seeded_db();
    let feed = write(&dir, "devices.json", DEVICES);

    let mut store = SqliteStore::open(&db, StoreOptions::default()).unwrap();
    assert!(store
        .try_acquire_run_lock("other-host", Utc::now(), Duration::minutes(30))
        .unwrap());

    let out = run(&["sync", "auto", "--db", s(&db), "--feed-file", s(&feed)]);
    assert_exit(&out, 7);

    store.release_run_lock("other-host").unwrap();
    let out = run(&["sync", "auto", "--db", s(&db), "--feed-file", s(&feed)]);
    assert_exit(&out, 0);
}

#[test]
fn bad_config_exits_3() {
    let dir = TempDir::new().unwrap();
    let config = write(
        &dir,
        "fleetlink.toml",
        "[policy]\nauto_apply_threshold = 0.5\nsuggestion_floor = 0.8\n",
    );
    let out = run(&["config", "validate", s(&config)]);
    assert_exit(&out, 3);

    let good = write(&dir, "good.toml", "name = \"riyadh depot\"\n[matching]\ntop_n = 5\n");
    let out = run(&["config", "validate", s(&good)]);
    assert_exit(&out, 0);
    assert!(String::from_utf8_lossy(&out.stderr).contains("riyadh depot"));
}

#[test]
fn normalize_prints_keys() {
    let out = run(&["normalize", "--json", "أ ب ج-١٢٣", "KSA ABJ 123"]);
    assert_exit(&out, 0);
    let keys = json_stdout(&out);
    assert_eq!(keys[0]["normalized"], "ABJ123");
    assert_eq!(keys[1]["normalized"], "KSAABJ123");
    assert_eq!(keys[1]["core"], "ABJ123");
}

#[test]
fn bad_vehicle_csv_exits_4() {
    let dir = TempDir::new().unwrap();
    let csv = write(&dir, "vehicles.csv", "vehicle_id,plate_number,active\nV1,ABJ123,sometimes\n");
    let db = dir.path().join("fleet.db");
    let out = run(&["vehicles", "import", "--db", s(&db), s(&csv)]);
    assert_exit(&out, 4);
}

#[test]
fn duplicate_plate_import_exits_4() {
    let (dir, db) = seeded_db();
    let csv = write(&dir, "more.csv", "vehicle_id,plate_number\nV7,abj-123\n");
    let out = run(&["vehicles", "import", "--db", s(&db), s(&csv)]);
    assert_exit(&out, 4);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("share plate 'ABJ123'"), "stderr: {stderr}");

    let out = run(&["vehicles", "list", "--db", s(&db), "--json"]);
    assert_eq!(json_stdout(&out).as_array().unwrap().len(), 4);
}
