//! Backend lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Visible backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendState {
    /// VM is not running
    #[default]
    Stopped,

    /// `start()` is in progress
    Starting,

    /// VM and guest services are up
    Started,

    /// `stop()` is in progress
    Stopping,

    /// The last lifecycle operation failed
    Error,

    /// Backend is unavailable on this host
    Disabled,
}

impl BackendState {
    /// Whether the VM is expected to be running or coming up.
    pub fn is_active(&self) -> bool {
        matches!(self, BackendState::Starting | BackendState::Started)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendState::Stopped => "STOPPED",
            BackendState::Starting => "STARTING",
            BackendState::Started => "STARTED",
            BackendState::Stopping => "STOPPING",
            BackendState::Error => "ERROR",
            BackendState::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

/// Lifecycle operation currently in flight.
///
/// At most one action runs per backend instance; requests issued while
/// another action is in flight are dropped, not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Starting,
    Stopping,
}
