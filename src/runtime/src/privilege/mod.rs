//! Privileged operation broker.
//!
//! Each [`PrivilegeProbe`] compares one piece of host state with what the
//! backend needs and reports a [`SudoCommand`] when they differ. The broker
//! joins every reported command into one shell script and asks for
//! elevation at most once. Nothing to do means the elevator is never touched.

mod elevator;
mod probes;

pub use elevator::{ElevationOutcome, Elevator, SystemElevator};
pub use probes::{macos_probes, NetworkHelperProbe, RunDirProbe, SudoersProbe};

use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};

/// Commands a probe needs run as root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SudoCommand {
    /// Shown to the user in the elevation prompt
    pub reason: String,
    pub commands: Vec<String>,
    /// Host paths the commands modify
    pub paths: Vec<String>,
}

/// Detects one privileged setup step that still needs doing.
#[async_trait]
pub trait PrivilegeProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the host is already in the desired state.
    async fn check(&self) -> Result<Option<SudoCommand>>;
}

/// Result of one broker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOutcome {
    /// Nothing needed elevation
    Skipped,
    /// The batch ran as root
    Elevated,
    /// The user refused; continue without privileged features
    Degraded,
}

/// Join all commands into one `/bin/sh -c` script.
///
/// The script is later wrapped in single quotes, so a command containing
/// `'` cannot be expressed and is rejected.
pub fn batch_script(commands: &[SudoCommand]) -> Result<String> {
    let lines: Vec<&str> = commands
        .iter()
        .flat_map(|c| c.commands.iter().map(String::as_str))
        .collect();

    if let Some(bad) = lines.iter().find(|line| line.contains('\'')) {
        return Err(VmError::UnsafeCommand((*bad).to_string()));
    }
    Ok(lines.join(" ; "))
}

/// Quote a path for use inside a batch script.
pub(crate) fn quote(path: &str) -> String {
    format!("\"{}\"", path)
}

pub struct PrivilegeBroker<'a> {
    elevator: &'a dyn Elevator,
}

impl<'a> PrivilegeBroker<'a> {
    pub fn new(elevator: &'a dyn Elevator) -> Self {
        Self { elevator }
    }

    /// Run every probe, then elevate once for whatever they reported.
    pub async fn run(&self, probes: &[Box<dyn PrivilegeProbe>]) -> Result<BrokerOutcome> {
        let checks = futures::future::try_join_all(probes.iter().map(|p| p.check())).await?;

        let mut needed = Vec::new();
        for (probe, command) in probes.iter().zip(checks) {
            if let Some(command) = command {
                tracing::info!(probe = probe.name(), reason = %command.reason, "Privileged setup required");
                needed.push(command);
            }
        }

        if needed.is_empty() {
            tracing::debug!("No privileged setup required");
            return Ok(BrokerOutcome::Skipped);
        }

        let script = batch_script(&needed)?;

        if self.elevator.is_root() || self.elevator.can_elevate_noninteractive().await {
            self.elevator.run_noninteractive(&script).await?;
            return Ok(BrokerOutcome::Elevated);
        }

        let reason = needed
            .iter()
            .map(|c| c.reason.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        match self.elevator.run_interactive(&script, &reason).await? {
            ElevationOutcome::Completed => Ok(BrokerOutcome::Elevated),
            ElevationOutcome::Denied => {
                tracing::warn!("Administrator access denied, continuing without it");
                Ok(BrokerOutcome::Degraded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeElevator, FakeProbe};

    fn command(cmds: &[&str]) -> SudoCommand {
        SudoCommand {
            reason: "test".to_string(),
            commands: cmds.iter().map(|c| c.to_string()).collect(),
            paths: vec![],
        }
    }

    #[test]
    fn test_batch_script_joins_everything() {
        let script = batch_script(&[command(&["mkdir -p /a", "chmod 755 /a"]), command(&["true"])])
            .unwrap();
        assert_eq!(script, "mkdir -p /a ; chmod 755 /a ; true");
    }

    #[test]
    fn test_batch_script_rejects_single_quote() {
        let err = batch_script(&[command(&["echo 'hi'"])]).unwrap_err();
        assert!(matches!(err, VmError::UnsafeCommand(_)));
    }

    #[tokio::test]
    async fn test_no_commands_never_touches_elevator() {
        let elevator = FakeElevator::interactive(ElevationOutcome::Completed);
        let probes: Vec<Box<dyn PrivilegeProbe>> =
            vec![Box::new(FakeProbe::satisfied()), Box::new(FakeProbe::satisfied())];

        let outcome = PrivilegeBroker::new(&elevator).run(&probes).await.unwrap();
        assert_eq!(outcome, BrokerOutcome::Skipped);
        assert_eq!(elevator.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_single_elevation_for_many_commands() {
        let elevator = FakeElevator::interactive(ElevationOutcome::Completed);
        let probes: Vec<Box<dyn PrivilegeProbe>> = vec![
            Box::new(FakeProbe::needs("mkdir -p /x")),
            Box::new(FakeProbe::satisfied()),
            Box::new(FakeProbe::needs("chmod 755 /x")),
        ];

        let outcome = PrivilegeBroker::new(&elevator).run(&probes).await.unwrap();
        assert_eq!(outcome, BrokerOutcome::Elevated);
        assert_eq!(elevator.interactive_scripts(), vec!["mkdir -p /x ; chmod 755 /x"]);
    }

    #[tokio::test]
    async fn test_prefers_noninteractive_elevation() {
        let elevator = FakeElevator::passwordless();
        let probes: Vec<Box<dyn PrivilegeProbe>> = vec![Box::new(FakeProbe::needs("true"))];

        let outcome = PrivilegeBroker::new(&elevator).run(&probes).await.unwrap();
        assert_eq!(outcome, BrokerOutcome::Elevated);
        assert_eq!(elevator.noninteractive_scripts(), vec!["true"]);
        assert!(elevator.interactive_scripts().is_empty());
    }

    #[tokio::test]
    async fn test_denial_degrades() {
        let elevator = FakeElevator::interactive(ElevationOutcome::Denied);
        let probes: Vec<Box<dyn PrivilegeProbe>> = vec![Box::new(FakeProbe::needs("true"))];

        let outcome = PrivilegeBroker::new(&elevator).run(&probes).await.unwrap();
        assert_eq!(outcome, BrokerOutcome::Degraded);
    }

    #[tokio::test]
    async fn test_unsafe_command_is_hard_error() {
        let elevator = FakeElevator::interactive(ElevationOutcome::Completed);
        let probes: Vec<Box<dyn PrivilegeProbe>> = vec![Box::new(FakeProbe::needs("echo 'x'"))];

        let err = PrivilegeBroker::new(&elevator).run(&probes).await.unwrap_err();
        assert!(matches!(err, VmError::UnsafeCommand(_)));
        assert_eq!(elevator.total_calls(), 0);
    }
}
