//! Typed observer channels for backend events.
//!
//! Each event kind gets its own broadcast channel so payload types survive
//! the boundary to the GUI process.

use crate::state::BackendState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Snapshot of the aggregated progress of the running lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Completed units
    pub current: u64,

    /// Total units for the current operation tree
    pub max: u64,

    /// Description of the most recently started step
    pub description: Option<String>,

    /// When `description` last changed
    pub transition_time: DateTime<Utc>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            current: 0,
            max: 0,
            description: None,
            transition_time: Utc::now(),
        }
    }
}

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A user-facing message that is neither progress nor a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, message)
    }
}

/// Bundle of per-kind event senders.
#[derive(Clone)]
pub struct BackendEvents {
    progress: Arc<broadcast::Sender<ProgressState>>,
    state: Arc<broadcast::Sender<BackendState>>,
    notifications: Arc<broadcast::Sender<Notification>>,
}

impl BackendEvents {
    /// Create the channels with the given per-channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (progress, _) = broadcast::channel(capacity);
        let (state, _) = broadcast::channel(capacity);
        let (notifications, _) = broadcast::channel(capacity);
        Self {
            progress: Arc::new(progress),
            state: Arc::new(state),
            notifications: Arc::new(notifications),
        }
    }

    pub fn emit_progress(&self, progress: ProgressState) {
        let _ = self.progress.send(progress);
    }

    pub fn emit_state(&self, state: BackendState) {
        let _ = self.state.send(state);
    }

    pub fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<BackendState> {
        self.state.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

impl Default for BackendEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
