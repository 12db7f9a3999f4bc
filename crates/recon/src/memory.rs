use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::model::{DeviceVehicleMapping, LinkMethod, LocationUpdate, MappingUpsert};
use crate::port::MappingRepository;

/// [`MappingRepository`] held entirely in memory. Same semantics as the
/// SQLite store: supersession keeps history, locations only move forward.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    mappings: Vec<DeviceVehicleMapping>,
    locations: HashMap<String, LocationUpdate>,
    known_vehicles: Option<HashSet<String>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject location writes for vehicles outside `ids`.
    pub fn with_vehicles<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_vehicles: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Every mapping ever opened, in creation order.
    pub fn history(&self) -> &[DeviceVehicleMapping] {
        &self.mappings
    }

    pub fn active_mappings(&self) -> Vec<&DeviceVehicleMapping> {
        self.mappings.iter().filter(|m| m.is_active()).collect()
    }

    pub fn active_for_tracker(&self, tracker_id: &str) -> Option<&DeviceVehicleMapping> {
        self.mappings
            .iter()
            .find(|m| m.is_active() && m.tracker_id == tracker_id)
    }

    pub fn active_for_vehicle(&self, vehicle_id: &str) -> Option<&DeviceVehicleMapping> {
        self.mappings
            .iter()
            .find(|m| m.is_active() && m.vehicle_id == vehicle_id)
    }

    pub fn location(&self, vehicle_id: &str) -> Option<&LocationUpdate> {
        self.locations.get(vehicle_id)
    }
}

impl MappingRepository for InMemoryRepository {
    fn upsert_mapping(
        &mut self,
        tracker_id: &str,
        vehicle_id: &str,
        method: LinkMethod,
        linked_at: DateTime<Utc>,
    ) -> Result<MappingUpsert, RepositoryError> {
        if self
            .active_for_tracker(tracker_id)
            .is_some_and(|m| m.vehicle_id == vehicle_id)
        {
            return Ok(MappingUpsert {
                created: false,
                superseded: 0,
            });
        }

        let mut superseded = 0;
        for m in self.mappings.iter_mut().filter(|m| m.is_active()) {
            if m.tracker_id == tracker_id || m.vehicle_id == vehicle_id {
                m.closed_at = Some(linked_at);
                superseded += 1;
            }
        }

        self.mappings.push(DeviceVehicleMapping {
            tracker_id: tracker_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            linked_at,
            link_method: method,
            closed_at: None,
        });

        Ok(MappingUpsert {
            created: true,
            superseded,
        })
    }

    fn update_vehicle_location(
        &mut self,
        vehicle_id: &str,
        update: &LocationUpdate,
    ) -> Result<bool, RepositoryError> {
        if let Some(known) = &self.known_vehicles {
            if !known.contains(vehicle_id) {
                return Err(RepositoryError::UnknownVehicle(vehicle_id.to_string()));
            }
        }

        if let Some(stored) = self.locations.get(vehicle_id) {
            if update.observed_at < stored.observed_at {
                return Ok(false);
            }
        }

        self.locations.insert(vehicle_id.to_string(), update.clone());
        Ok(true)
    }

    fn vehicle_owner(&self, vehicle_id: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .active_for_vehicle(vehicle_id)
            .map(|m| m.tracker_id.clone()))
    }
}
