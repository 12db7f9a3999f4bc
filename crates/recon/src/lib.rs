//! `fleetlink-recon`: tracker-to-vehicle reconciliation engine.
//!
//! Pure engine crate: takes a vehicle set plus device reports, normalizes
//! plates, ranks candidates and decides which links to apply. Storage and
//! device discovery come in through the traits in [`port`].

pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod port;
pub mod summary;

pub use config::ReconConfig;
pub use engine::{CancelToken, Reconciler, RunControl};
pub use error::{FeedError, ReconError, RepositoryError};
pub use memory::InMemoryRepository;
pub use model::{
    DeviceRecord, LinkMethod, ManualEntry, MatchCandidate, MatchReason, MatchSuggestion,
    SyncMode, SyncSummary, VehicleRecord,
};
pub use normalize::{normalize, NormalizedPlate, Normalizer};
pub use port::{DeviceFeed, MappingRepository, StaticFeed};
