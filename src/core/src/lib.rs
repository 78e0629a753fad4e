//! nodevm Core - Foundational Types
//!
//! Settings, error types, backend states and typed event channels shared by
//! the runtime and the CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod state;

// Re-export commonly used types
pub use config::{BackendSettings, ConfigFlag, MountType, NodeSettings, VmType};
pub use error::{Result, VmError};
pub use event::{BackendEvents, Notification, NotificationLevel, ProgressState};
pub use state::{Action, BackendState};

/// nodevm version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
