// SQLite-backed mapping store

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetlink_recon::model::{
    DeviceVehicleMapping, GeoPoint, LinkMethod, LocationUpdate, MappingUpsert, VehicleRecord,
};
use fleetlink_recon::{normalize, MappingRepository, RepositoryError};
use log::{debug, info};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use crate::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vehicles (
    vehicle_id TEXT PRIMARY KEY,
    plate_number TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    latitude REAL,
    longitude REAL,
    address TEXT,
    location_observed_at TEXT        -- RFC 3339, NULL until the first fix
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_vehicles_active_plate
    ON vehicles(plate_number) WHERE active = 1 AND plate_number <> '';

CREATE TABLE IF NOT EXISTS device_vehicle_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tracker_id TEXT NOT NULL,
    vehicle_id TEXT NOT NULL REFERENCES vehicles(vehicle_id),
    linked_at TEXT NOT NULL,
    link_method TEXT NOT NULL,       -- 'auto' | 'manual'
    closed_at TEXT                   -- NULL while active
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_active_tracker
    ON device_vehicle_mappings(tracker_id) WHERE closed_at IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_active_vehicle
    ON device_vehicle_mappings(vehicle_id) WHERE closed_at IS NULL;

CREATE TABLE IF NOT EXISTS run_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// One row of the vehicle import file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleImport {
    pub vehicle_id: String,
    pub plate_number: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleRow {
    pub vehicle_id: String,
    pub plate_number: String,
    pub active: bool,
    pub location: Option<LocationUpdate>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn, options)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, StoreOptions::default())
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ---------------------------------------------------------------------
    // Vehicles
    // ---------------------------------------------------------------------

    /// Insert or refresh vehicles by id. Stored locations are kept.
    ///
    /// Fails with [`StoreError::Invalid`] when two vehicles would be active
    /// under the same normalized plate; nothing is written in that case.
    pub fn import_vehicles(&mut self, vehicles: &[VehicleImport]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;

        let mut active: BTreeMap<String, String> = {
            let mut stmt =
                tx.prepare("SELECT vehicle_id, plate_number FROM vehicles WHERE active = 1")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<BTreeMap<_, _>, _>>()?
        };
        for v in vehicles {
            if v.vehicle_id.trim().is_empty() {
                return Err(StoreError::Invalid("empty vehicle_id".into()));
            }
            if v.active {
                active.insert(v.vehicle_id.trim().to_string(), v.plate_number.clone());
            } else {
                active.remove(v.vehicle_id.trim());
            }
        }
        check_unique_plates(&active)?;

        {
            // Park the imported rows first so a plate can move between them.
            let mut park = tx.prepare("UPDATE vehicles SET active = 0 WHERE vehicle_id = ?1")?;
            for v in vehicles {
                park.execute(params![v.vehicle_id.trim()])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO vehicles (vehicle_id, plate_number, active) VALUES (?1, ?2, ?3)
                 ON CONFLICT(vehicle_id) DO UPDATE SET
                     plate_number = excluded.plate_number,
                     active = excluded.active",
            )?;
            for v in vehicles {
                stmt.execute(params![v.vehicle_id.trim(), v.plate_number, v.active])
                    .map_err(|e| match e.sqlite_error_code() {
                        // Same raw plate with an empty normalized key.
                        Some(ErrorCode::ConstraintViolation) => StoreError::Invalid(format!(
                            "plate '{}' of {} is still held by another active vehicle",
                            v.plate_number,
                            v.vehicle_id.trim()
                        )),
                        _ => e.into(),
                    })?;
            }
        }
        tx.commit()?;
        info!("imported {} vehicles", vehicles.len());
        Ok(vehicles.len())
    }

    /// The reconciliation candidate set.
    pub fn active_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vehicle_id, plate_number FROM vehicles WHERE active = 1 ORDER BY vehicle_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(VehicleRecord {
                vehicle_id: row.get(0)?,
                plate_number: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn vehicles(&self) -> Result<Vec<VehicleRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vehicle_id, plate_number, active, latitude, longitude, address, location_observed_at
             FROM vehicles ORDER BY vehicle_id",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    RawLocation {
                        latitude: row.get(3)?,
                        longitude: row.get(4)?,
                        address: row.get(5)?,
                        observed_at: row.get(6)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(vehicle_id, plate_number, active, loc)| {
                Ok(VehicleRow {
                    vehicle_id,
                    plate_number,
                    active,
                    location: loc.decode()?,
                })
            })
            .collect()
    }

    /// Last stored location, `None` when the vehicle has no fix yet.
    pub fn vehicle_location(&self, vehicle_id: &str) -> Result<Option<LocationUpdate>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT latitude, longitude, address, location_observed_at FROM vehicles WHERE vehicle_id = ?1",
                params![vehicle_id],
                RawLocation::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownVehicle(vehicle_id.to_string()))?;
        raw.decode()
    }

    // ---------------------------------------------------------------------
    // Mappings
    // ---------------------------------------------------------------------

    pub fn active_mappings(&self) -> Result<Vec<DeviceVehicleMapping>, StoreError> {
        self.query_mappings(
            "SELECT tracker_id, vehicle_id, linked_at, link_method, closed_at
             FROM device_vehicle_mappings WHERE closed_at IS NULL ORDER BY tracker_id",
            params![],
        )
    }

    /// Every mapping the tracker ever had, oldest first.
    pub fn mapping_history(&self, tracker_id: &str) -> Result<Vec<DeviceVehicleMapping>, StoreError> {
        self.query_mappings(
            "SELECT tracker_id, vehicle_id, linked_at, link_method, closed_at
             FROM device_vehicle_mappings WHERE tracker_id = ?1 ORDER BY id",
            params![tracker_id],
        )
    }

    fn query_mappings(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DeviceVehicleMapping>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(tracker_id, vehicle_id, linked_at, method, closed_at)| {
                let link_method = LinkMethod::parse(&method)
                    .ok_or_else(|| StoreError::Corrupt(format!("link_method '{method}'")))?;
                Ok(DeviceVehicleMapping {
                    tracker_id,
                    vehicle_id,
                    linked_at: parse_ts(&linked_at)?,
                    link_method,
                    closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
                })
            })
            .collect()
    }

    fn upsert(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT vehicle_id FROM device_vehicle_mappings
                 WHERE tracker_id = ?1 AND closed_at IS NULL",
                params![tracker_id],
                |row| row.get(0),
            )
            .optional()?;
        if current.as_deref() == Some(vehicle_id) {
            return Ok(MappingUpsert::default());
        }

        let known: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM vehicles WHERE vehicle_id = ?1)",
            params![vehicle_id],
            |row| row.get(0),
        )?;
        if !known {
            return Err(StoreError::UnknownVehicle(vehicle_id.to_string()));
        }

        let stamp = format_ts(linked_at);
        let superseded = tx.execute(
            "UPDATE device_vehicle_mappings SET closed_at = ?3
             WHERE closed_at IS NULL AND (tracker_id = ?1 OR vehicle_id = ?2)",
            params![tracker_id, vehicle_id, stamp],
        )?;
        tx.execute(
            "INSERT INTO device_vehicle_mappings (tracker_id, vehicle_id, linked_at, link_method)
             VALUES (?1, ?2, ?3, ?4)",
            params![tracker_id, vehicle_id, stamp, method.as_str()],
        )?;
        tx.commit()?;

        debug!("mapping {tracker_id} -> {vehicle_id} stored, {superseded} closed");
        Ok(MappingUpsert {
            created: true,
            superseded,
        })
    }

    fn write_location(&mut self, vehicle_id: &str, update: &LocationUpdate) -> Result<bool, StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<Option<String>> = tx
            .query_row(
                "SELECT location_observed_at FROM vehicles WHERE vehicle_id = ?1",
                params![vehicle_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            return Err(StoreError::UnknownVehicle(vehicle_id.to_string()));
        };
        if let Some(stored) = stored {
            if update.observed_at < parse_ts(&stored)? {
                return Ok(false);
            }
        }

        tx.execute(
            "UPDATE vehicles SET latitude = ?2, longitude = ?3, address = ?4, location_observed_at = ?5
             WHERE vehicle_id = ?1",
            params![
                vehicle_id,
                update.point.latitude,
                update.point.longitude,
                update.address,
                format_ts(update.observed_at),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Run lock
    // ---------------------------------------------------------------------

    /// Take the single run lease for `ttl`. Returns `false` while another
    /// owner holds an unexpired lease. The same owner may renew.
    pub fn try_acquire_run_lock(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: Option<(String, String)> = tx
            .query_row("SELECT owner, expires_at FROM run_lock WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        if let Some((holder, expires_at)) = held {
            if holder != owner && parse_ts(&expires_at)? > now {
                debug!("run lock held by {holder} until {expires_at}");
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO run_lock (id, owner, acquired_at, expires_at) VALUES (1, ?1, ?2, ?3)",
            params![owner, format_ts(now), format_ts(now + ttl)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Drop the lease if `owner` holds it. Returns whether anything was released.
    pub fn release_run_lock(&mut self, owner: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM run_lock WHERE id = 1 AND owner = ?1", params![owner])?;
        Ok(n > 0)
    }
}

impl MappingRepository for SqliteStore {
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError> {
        Ok(self.upsert(tracker_id, vehicle_id, method, linked_at)?)
    }

    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError> {
        Ok(self.write_location(vehicle_id, update)?)
    }

    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError> {
        let owner = self
            .conn
            .query_row(
                "SELECT tracker_id FROM device_vehicle_mappings
                 WHERE vehicle_id = ?1 AND closed_at IS NULL",
                params![vehicle_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(owner)
    }
}

/// Reject two active vehicles sharing a normalized plate. Empty plates never
/// match anything and are left alone.
fn check_unique_plates(active: &BTreeMap<String, String>) -> Result<(), StoreError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for (vehicle_id, plate) in active {
        let key = normalize(plate).value;
        if key.is_empty() {
            continue;
        }
        if let Some(other) = seen.insert(key.clone(), vehicle_id) {
            return Err(StoreError::Invalid(format!(
                "vehicles {other} and {vehicle_id} share plate '{key}'"
            )));
        }
    }
    Ok(())
}

struct RawLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: Option<String>,
    observed_at: Option<String>,
}

impl RawLocation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            latitude: row.get(0)?,
            longitude: row.get(1)?,
            address: row.get(2)?,
            observed_at: row.get(3)?,
        })
    }

    fn decode(self) -> Result<Option<LocationUpdate>, StoreError> {
        let (Some(point), Some(observed_at)) = (
            GeoPoint::from_parts(self.latitude, self.longitude),
            self.observed_at,
        ) else {
            return Ok(None);
        };
        Ok(Some(LocationUpdate {
            point,
            address: self.address,
            observed_at: parse_ts(&observed_at)?,
        }))
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}
