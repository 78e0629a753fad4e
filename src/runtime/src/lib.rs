//! nodevm Runtime - VM backend orchestration.
//!
//! This crate drives the virtual machine that hosts the container engine and
//! the node service: the Lima instance on macOS and Linux, the WSL2
//! distribution on Windows. It owns the lifecycle state machine, progress
//! reporting, privileged host setup, descriptor reconciliation and guest
//! command execution.

#![allow(clippy::result_large_err)]

pub mod executor;
pub mod host_check;
pub mod lifecycle;
pub mod lima;
pub mod paths;
pub mod privilege;
pub mod process;
pub mod progress;
pub mod readiness;
pub mod services;
pub mod wsl;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use executor::{ExecOptions, GuestExecutor};
pub use host_check::{check_virtualization_support, HostCapabilities, NativeHost, VirtualizationSupport};
pub use lifecycle::{create_backend, unsupported_platform, BackendContext, BackendDeps, HostPlatform, LifecycleCore, VmBackend};
pub use lima::LimaBackend;
pub use paths::Paths;
pub use privilege::{BrokerOutcome, ElevationOutcome, Elevator, PrivilegeBroker, PrivilegeProbe, SudoCommand};
pub use process::{CommandRunner, Diagnostics, DiagnosticsLog};
pub use progress::{ProgressScope, ProgressTracker};
pub use readiness::{poll_forever, poll_until, JsonRpcStatusProbe, StatusProbe};
pub use wsl::WslBackend;

/// nodevm Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
