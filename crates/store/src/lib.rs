//! `fleetlink-store`: SQLite persistence for vehicles, tracker mappings and
//! the cross-process run lock.
//!
//! [`SqliteStore`] implements [`fleetlink_recon::MappingRepository`], so the
//! engine writes through it directly.

mod sqlite;

pub use sqlite::{SqliteStore, StoreOptions, VehicleImport, VehicleRow};

use fleetlink_recon::RepositoryError;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite stayed busy/locked past the busy timeout.
    #[error("database busy: {0}")]
    Busy(String),
    #[error("unknown vehicle '{0}'")]
    UnknownVehicle(String),
    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("sqlite error: {0}")]
    Db(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Busy(err.to_string()),
            _ => Self::Db(err.to_string()),
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(message) => Self::Timeout(message),
            StoreError::UnknownVehicle(id) => Self::UnknownVehicle(id),
            other => Self::Storage(other.to_string()),
        }
    }
}
