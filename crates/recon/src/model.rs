use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A coordinate pair. Latitude and longitude only ever travel together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Build a point from optional parts. Returns `None` unless both are present.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Self { latitude, longitude }),
            _ => None,
        }
    }

    pub fn in_range(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One tracker unit, reported by the provider or entered by an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub tracker_id: String,
    pub raw_plate: String,
    pub location: Option<GeoPoint>,
    pub address: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// A fleet vehicle eligible for matching. Owned by the vehicle registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub plate_number: String,
}

impl VehicleRecord {
    pub fn new(vehicle_id: impl Into<String>, plate_number: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            plate_number: plate_number.into(),
        }
    }
}

/// Operator-supplied device/plate pair for manual mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub tracker_id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Which scoring rule produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactMatch,
    PrefixVariant,
    FuzzyMatch,
    DigitsSubset,
}

impl std::fmt::Display for MatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExactMatch => write!(f, "exact_match"),
            Self::PrefixVariant => write!(f, "prefix_variant"),
            Self::FuzzyMatch => write!(f, "fuzzy_match"),
            Self::DigitsSubset => write!(f, "digits_subset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub vehicle_id: String,
    #[serde(rename = "plate")]
    pub plate_number: String,
    pub score: f64,
    pub reason: MatchReason,
}

/// A device whose candidates did not clear the auto-apply bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSuggestion {
    pub tracker_id: String,
    pub device_plate: String,
    pub normalized_plate: String,
    pub top_candidates: Vec<MatchCandidate>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    Auto,
    Manual,
}

impl LinkMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted device↔vehicle link. `closed_at == None` means active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceVehicleMapping {
    pub tracker_id: String,
    pub vehicle_id: String,
    pub linked_at: DateTime<Utc>,
    pub link_method: LinkMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl DeviceVehicleMapping {
    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Result of an upsert. `superseded` counts the active mappings it closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingUpsert {
    pub created: bool,
    pub superseded: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub point: GeoPoint,
    pub address: Option<String>,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Per-device outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Auto,
    Manual,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Writes that actually landed for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedWrites {
    pub mapping_created: bool,
    pub location_updated: bool,
}

impl AppliedWrites {
    pub fn touched_vehicle(&self) -> bool {
        self.mapping_created || self.location_updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingTrackerId,
    IncompletePair,
    NoCandidates,
    DuplicateTracker,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTrackerId => write!(f, "missing tracker id"),
            Self::IncompletePair => write!(f, "incomplete tracker/plate pair"),
            Self::NoCandidates => write!(f, "no candidate vehicles"),
            Self::DuplicateTracker => write!(f, "tracker repeated in batch"),
        }
    }
}

/// The single bucket a device lands in after one run.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    Mapped {
        tracker_id: String,
        vehicle_id: String,
        method: LinkMethod,
        applied: AppliedWrites,
    },
    Suggested(MatchSuggestion),
    Skipped {
        tracker_id: String,
        reason: SkipReason,
    },
    Errored {
        tracker_id: String,
        plate: String,
        vehicle_id: Option<String>,
        message: String,
        applied: AppliedWrites,
    },
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub plate: String,
    pub tracker_id: String,
}

/// Outcome of one reconciliation run, handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub mode: SyncMode,
    pub matched: usize,
    pub updated_vehicles: usize,
    pub upserted_mappings: usize,
    pub updated_locations: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub unmatched_suggestions: Vec<MatchSuggestion>,
    pub discovered_devices: Vec<DiscoveredDevice>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}
