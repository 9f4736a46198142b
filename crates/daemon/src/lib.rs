// Service modules (daemon functionality)
pub mod config;
pub mod service;
pub mod state;

pub use config::{CompactionConfig, ConfigError, DaemonConfig};
pub use service::{MaintenanceService, ShutdownHandle};
pub use state::{DaemonState, StateError};
