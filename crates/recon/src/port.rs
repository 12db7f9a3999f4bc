//! Seams to the outside world.
//!
//! The engine never talks to a database or the tracking provider directly.
//! Storage comes in through [`MappingRepository`] and device discovery
//! through [`DeviceFeed`]; both are borrowed mutably for the length of a run,
//! which serializes runs against the same handle.

use chrono::{DateTime, Utc};

use crate::error::{FeedError, RepositoryError};
use crate::model::{DeviceRecord, LinkMethod, LocationUpdate, MappingUpsert};

pub trait MappingRepository {
    /// Link `tracker_id` to `vehicle_id`.
    ///
    /// Re-linking the same pair is a no-op that returns `created: false`.
    /// Any other active mapping for either the tracker or the vehicle is
    /// closed (kept as history) before the new one opens.
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError>;

    /// Store the vehicle's last known location unless the stored one was
    /// observed later. Returns whether the write happened.
    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError>;

    /// Tracker currently holding an active mapping to `vehicle_id`, if any.
    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError>;
}

pub trait DeviceFeed {
    /// Pull the full device list from the provider.
    fn discover(&mut self) -> Result<Vec<DeviceRecord>, FeedError>;
}

impl<R: MappingRepository + ?Sized> MappingRepository for &mut R {
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError> {
        (**self).upsert_mapping(tracker_id, vehicle_id, method, linked_at)
    }

    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError> {
        (**self).update_vehicle_location(vehicle_id, update)
    }

    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError> {
        (**self).vehicle_owner(vehicle_id)
    }
}

/// A fixed device list; useful when devices were fetched ahead of the run.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    devices: Vec<DeviceRecord>,
}

impl StaticFeed {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }
}

impl DeviceFeed for StaticFeed {
    fn discover(&mut self) -> Result<Vec<DeviceRecord>, FeedError> {
        Ok(self.devices.clone())
    }
}
