pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::Error;

/// Default SSH port probed during discovery and heartbeat sweeps
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default broker port (NATS)
pub const DEFAULT_BROKER_PORT: u16 = 4222;

/// Queue names
pub const QUEUE_METRICS: &str = "metrics";
pub const QUEUE_DISCOVERY: &str = "discovery";
pub const QUEUE_ALERTS: &str = "alerts";
pub const QUEUE_DEAD_LETTER: &str = "dead_letter";

/// Queue limits applied to every stream declaration
pub const QUEUE_MESSAGE_TTL_SECS: u64 = 86_400;
pub const QUEUE_MAX_LENGTH: i64 = 100_000;

/// Control loop defaults
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
