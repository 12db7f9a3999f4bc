//! `fleetlink vehicles` and `fleetlink mappings`: inspect and seed the store.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use fleetlink_recon::ReconConfig;
use fleetlink_store::{StoreError, VehicleImport};
use serde::{Deserialize, Serialize};

use crate::exit_codes::{EXIT_STORAGE, EXIT_USAGE, EXIT_VALIDATION};
use crate::sync::open_store;
use crate::CliError;

#[derive(Subcommand)]
pub enum VehiclesCommands {
    /// Insert or refresh vehicles from a CSV file
    #[command(after_help = "\
Examples:
  fleetlink vehicles import --db fleet.db vehicles.csv

CSV columns: vehicle_id,plate_number[,active]  (active: true/false/1/0, default true)")]
    Import {
        #[arg(long)]
        db: PathBuf,

        /// CSV file with a header row
        file: PathBuf,
    },

    /// List vehicles with their last known location
    List {
        #[arg(long)]
        db: PathBuf,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

pub fn cmd_vehicles(cmd: VehiclesCommands) -> Result<(), CliError> {
    match cmd {
        VehiclesCommands::Import { db, file } => cmd_vehicles_import(&db, &file),
        VehiclesCommands::List { db, json } => cmd_vehicles_list(&db, json),
    }
}

#[derive(Deserialize)]
struct CsvVehicle {
    vehicle_id: String,
    plate_number: String,
    #[serde(default)]
    active: Option<String>,
}

fn parse_active(raw: Option<&str>, line: usize) -> Result<bool, CliError> {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(CliError::new(
            EXIT_VALIDATION,
            format!("line {line}: invalid active value '{other}'"),
        )),
    }
}

pub fn read_vehicles_csv(path: &Path) -> Result<Vec<VehicleImport>, CliError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot read {}: {e}", path.display())))?;

    let mut vehicles = Vec::new();
    for (i, row) in reader.deserialize::<CsvVehicle>().enumerate() {
        // header is line 1
        let line = i + 2;
        let row = row.map_err(|e| CliError::new(EXIT_VALIDATION, format!("line {line}: {e}")))?;
        if row.vehicle_id.is_empty() {
            return Err(CliError::new(EXIT_VALIDATION, format!("line {line}: empty vehicle_id")));
        }
        vehicles.push(VehicleImport {
            active: parse_active(row.active.as_deref(), line)?,
            vehicle_id: row.vehicle_id,
            plate_number: row.plate_number,
        });
    }
    Ok(vehicles)
}

fn cmd_vehicles_import(db: &Path, file: &Path) -> Result<(), CliError> {
    let vehicles = read_vehicles_csv(file)?;
    let mut store = open_store(db, &ReconConfig::default())?;
    let n = store.import_vehicles(&vehicles).map_err(|e| match e {
        StoreError::Invalid(message) => CliError::new(EXIT_VALIDATION, message)
            .with_hint("each active vehicle needs its own plate; deactivate the old one first"),
        other => CliError::new(EXIT_STORAGE, other.to_string()),
    })?;
    eprintln!("imported {n} vehicles into {}", db.display());
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VehicleView {
    vehicle_id: String,
    plate_number: String,
    normalized_plate: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_observed_at: Option<String>,
}

fn cmd_vehicles_list(db: &Path, json: bool) -> Result<(), CliError> {
    let store = open_store(db, &ReconConfig::default())?;
    let rows = store
        .vehicles()
        .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;

    let views: Vec<VehicleView> = rows
        .into_iter()
        .map(|v| VehicleView {
            normalized_plate: fleetlink_recon::normalize(&v.plate_number).value,
            latitude: v.location.as_ref().map(|l| l.point.latitude),
            longitude: v.location.as_ref().map(|l| l.point.longitude),
            address: v.location.as_ref().and_then(|l| l.address.clone()),
            location_observed_at: v.location.as_ref().map(|l| l.observed_at.to_rfc3339()),
            vehicle_id: v.vehicle_id,
            plate_number: v.plate_number,
            active: v.active,
        })
        .collect();

    if json {
        print_json(&views)?;
        return Ok(());
    }

    for v in &views {
        let location = match (v.latitude, v.longitude) {
            (Some(lat), Some(lon)) => format!(
                "{lat:.5},{lon:.5} @ {}",
                v.location_observed_at.as_deref().unwrap_or("-")
            ),
            _ => "-".to_string(),
        };
        println!(
            "{}\t{}\t{}\t{}\t{}",
            v.vehicle_id,
            v.plate_number,
            v.normalized_plate,
            if v.active { "active" } else { "inactive" },
            location
        );
    }
    Ok(())
}

/// Active mappings, or one tracker's full history with `--tracker`.
pub fn cmd_mappings(db: &Path, tracker: Option<String>, json: bool) -> Result<(), CliError> {
    let store = open_store(db, &ReconConfig::default())?;
    let mappings = match &tracker {
        Some(id) => store.mapping_history(id),
        None => store.active_mappings(),
    }
    .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;

    if json {
        return print_json(&mappings);
    }

    for m in &mappings {
        let closed = m
            .closed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "active".to_string());
        println!(
            "{}\t{}\t{}\t{}\t{}",
            m.tracker_id,
            m.vehicle_id,
            m.link_method,
            m.linked_at.to_rfc3339(),
            closed
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json_str = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::new(EXIT_USAGE, format!("JSON serialization error: {e}")))?;
    println!("{json_str}");
    Ok(())
}
