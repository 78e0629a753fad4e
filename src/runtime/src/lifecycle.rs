//! Backend lifecycle shared by the Lima and WSL strategies.
//!
//! ```text
//!            start()                     boot + services ok
//! STOPPED ──────────────▶ STARTING ─────────────────────────▶ STARTED
//!    ▲                        │ error                            │
//!    │                        ▼                                  │ stop()
//!    │      stop() ok       ERROR ◀──── terminate failed ──┐     ▼
//!    └───────────────────────────────────────────────── STOPPING
//! ```
//!
//! At most one lifecycle operation runs per backend. [`LifecycleCore::begin`]
//! claims the [`Action`] slot; a call that finds it taken is a no-op.

use crate::executor::GuestExecutor;
use crate::host_check::{HostCapabilities, NativeHost};
use crate::paths::Paths;
use crate::privilege::{Elevator, SystemElevator};
use crate::process::{CommandRunner, Diagnostics, DiagnosticsLog};
use crate::progress::ProgressTracker;
use crate::readiness::{JsonRpcStatusProbe, StatusProbe};
use async_trait::async_trait;
use nodevm_core::config::BackendSettings;
use nodevm_core::error::{Result, VmError};
use nodevm_core::event::{BackendEvents, Notification};
use nodevm_core::state::{Action, BackendState};
use parking_lot::Mutex;
use std::sync::Arc;

/// Mutable state owned by one backend.
///
/// Each field has exactly one writer.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Written only by the config reconciler; fixed for the process lifetime
    /// once allocated.
    pub ssh_port: Option<u16>,

    /// Written only by the privilege broker. Once the user refuses
    /// elevation this stays `false` until the process exits.
    pub admin_access: bool,

    /// Written only by `start()`: the snapshot of the caller's settings.
    pub settings: BackendSettings,
}

impl Default for BackendContext {
    fn default() -> Self {
        Self {
            ssh_port: None,
            admin_access: true,
            settings: BackendSettings::default(),
        }
    }
}

struct ActionSlot {
    action: Action,
    generation: u64,
}

/// State, reentrancy guard, progress and diagnostics shared by strategies.
pub struct LifecycleCore {
    state: Mutex<BackendState>,
    slot: Arc<Mutex<ActionSlot>>,
    progress: ProgressTracker,
    events: BackendEvents,
    diagnostics: DiagnosticsLog,
}

impl LifecycleCore {
    pub fn new(events: BackendEvents, diagnostics: DiagnosticsLog) -> Self {
        Self {
            state: Mutex::new(BackendState::Stopped),
            slot: Arc::new(Mutex::new(ActionSlot {
                action: Action::None,
                generation: 0,
            })),
            progress: ProgressTracker::new(events.clone()),
            events,
            diagnostics,
        }
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    /// The only way to change the backend state; every change is emitted.
    pub fn set_state(&self, state: BackendState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Backend state changed");
        }
        self.events.emit_state(state);
    }

    /// Claim the action slot, or `None` when another operation holds it.
    pub fn begin(&self, action: Action) -> Option<ActionGuard> {
        let mut slot = self.slot.lock();
        if slot.action != Action::None {
            tracing::debug!(current = ?slot.action, requested = ?action, "Lifecycle operation in flight, ignoring");
            return None;
        }
        slot.action = action;
        slot.generation += 1;
        Some(ActionGuard {
            slot: Arc::clone(&self.slot),
            action,
            generation: slot.generation,
        })
    }

    pub fn current_action(&self) -> Action {
        self.slot.lock().action
    }

    /// Release the action slot so the running operation winds down at its
    /// next checkpoint. The caller owns the next state transition.
    pub fn interrupt(&self) {
        let mut slot = self.slot.lock();
        if slot.action != Action::None {
            tracing::info!(action = ?slot.action, "Interrupting lifecycle operation");
            slot.action = Action::None;
            slot.generation += 1;
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn events(&self) -> &BackendEvents {
        &self.events
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.snapshot()
    }

    pub fn notify_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(message = %message, "Backend warning");
        self.events.notify(Notification::warning(message));
    }

    /// Settle the outcome of a start sequence.
    ///
    /// A non-fatal error still ends in `Error`, with a warning notification
    /// instead of a returned error. A fatal error ends in `Error` and is
    /// returned.
    pub fn settle_start(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => {
                self.diagnostics.record_error(&e.to_string());
                self.set_state(BackendState::Error);
                self.notify_warning(e.to_string());
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Start failed");
                self.diagnostics.record_error(&e.to_string());
                self.set_state(BackendState::Error);
                Err(e)
            }
        }
    }
}

/// Holds the action slot; releases it on drop.
pub struct ActionGuard {
    slot: Arc<Mutex<ActionSlot>>,
    action: Action,
    generation: u64,
}

impl ActionGuard {
    /// Whether this operation still owns the slot.
    pub fn is_current(&self) -> bool {
        let slot = self.slot.lock();
        slot.action == self.action && slot.generation == self.generation
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.generation == self.generation {
            slot.action = Action::None;
        }
    }
}

/// Return `Ok(())` from the enclosing sequence once the guard is lost.
macro_rules! checkpoint {
    ($guard:expr) => {
        if !$guard.is_current() {
            tracing::info!("Lifecycle operation interrupted");
            return Ok(());
        }
    };
}
pub(crate) use checkpoint;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A VM backend. Implemented only by [`crate::lima::LimaBackend`] and
/// [`crate::wsl::WslBackend`].
#[async_trait]
pub trait VmBackend: sealed::Sealed + Send + Sync {
    fn name(&self) -> &'static str;

    fn core(&self) -> &LifecycleCore;

    fn state(&self) -> BackendState {
        self.core().state()
    }

    /// Guest access for the running VM.
    fn executor(&self) -> Arc<dyn GuestExecutor>;

    async fn start(&self, settings: &BackendSettings) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Stop, then unregister the VM.
    async fn del(&self) -> Result<()>;

    async fn reset(&self, settings: &BackendSettings) -> Result<()> {
        self.stop().await?;
        self.start(settings).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Linux,
    Windows,
}

impl HostPlatform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(HostPlatform::MacOs)
        } else if cfg!(target_os = "linux") {
            Some(HostPlatform::Linux)
        } else if cfg!(target_os = "windows") {
            Some(HostPlatform::Windows)
        } else {
            None
        }
    }
}

/// Collaborators injected into a backend.
#[derive(Clone)]
pub struct BackendDeps {
    pub paths: Paths,
    pub events: BackendEvents,
    pub diagnostics: DiagnosticsLog,
    pub host: Arc<dyn HostCapabilities>,
    pub elevator: Arc<dyn Elevator>,
    pub status_probe: Arc<dyn StatusProbe>,
}

impl BackendDeps {
    /// Production collaborators.
    pub fn system(paths: Paths, events: BackendEvents) -> Self {
        let diagnostics = DiagnosticsLog::new();
        let runner = CommandRunner::new(diagnostics.clone());
        Self {
            paths,
            events,
            host: Arc::new(NativeHost::new(runner.clone())),
            elevator: Arc::new(SystemElevator::new(runner)),
            status_probe: Arc::new(JsonRpcStatusProbe::new()),
            diagnostics,
        }
    }
}

/// Select the strategy for `platform`.
pub fn create_backend(platform: HostPlatform, deps: BackendDeps) -> Box<dyn VmBackend> {
    match platform {
        HostPlatform::MacOs | HostPlatform::Linux => {
            Box::new(crate::lima::LimaBackend::new(platform, deps))
        }
        HostPlatform::Windows => Box::new(crate::wsl::WslBackend::new(deps)),
    }
}

/// Error for a backend that cannot run on this host.
pub fn unsupported_platform() -> VmError {
    VmError::fatal("nodevm supports macOS, Linux and Windows only")
}
