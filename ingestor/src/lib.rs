pub mod batching;
pub mod broadcast;
pub mod broker;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod connection;
pub mod db;
pub mod decode;
pub mod errors;
pub mod liveness;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod periodic;
pub mod registry;
pub mod repository;
pub mod status;

pub use batching::{alert_status_for, BatcherSettings, TelemetryBatcher};
pub use broadcast::{BroadcastEvent, BroadcastSink, Broadcaster};
pub use cleanup::{CleanupScheduler, CleanupSettings, CleanupStatus, SchedulerState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionSettings};
pub use errors::{BrokerError, Error, Result};
pub use liveness::{LivenessMonitor, LivenessSettings};
pub use repository::{MemoryRepository, Repository};
pub use status::StatusTracker;
