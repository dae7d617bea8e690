pub mod api;
pub mod config;
pub mod extract;
pub mod orchestrator;
pub mod ratelimit;
pub mod reconcile;
pub mod storage;
pub mod upstream;

pub use config::{Config, StorageConfig, UpstreamConfig};
pub use extract::{ExtractionStrategy, TripThresholds, extract_trips};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use ratelimit::{RateLimitConfig, RateLimitedClient};
pub use reconcile::{ReconcileOutcome, reconcile};
pub use storage::memory::MemoryStorage;
pub use storage::sqlite::SqliteStorage;
pub use storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};
pub use upstream::{TripReport, UpstreamError, UpstreamProvider};
