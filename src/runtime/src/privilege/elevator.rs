use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};
use std::path::Path;

/// Result of an interactive elevation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationOutcome {
    Completed,
    /// The user dismissed or failed the prompt
    Denied,
}

/// Runs a shell script with host root privileges.
#[async_trait]
pub trait Elevator: Send + Sync {
    fn is_root(&self) -> bool;

    /// Whether `sudo -n true` succeeds (cached credentials or NOPASSWD).
    async fn can_elevate_noninteractive(&self) -> bool;

    async fn run_noninteractive(&self, script: &str) -> Result<()>;

    /// Prompt the user. A refusal is `Ok(Denied)`, not an error.
    async fn run_interactive(&self, script: &str, reason: &str) -> Result<ElevationOutcome>;
}

/// `sudo` for the non-interactive path; `osascript` (macOS) or `pkexec`
/// (Linux) for the prompt.
pub struct SystemElevator {
    runner: CommandRunner,
}

impl SystemElevator {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Elevator for SystemElevator {
    fn is_root(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail.
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    async fn can_elevate_noninteractive(&self) -> bool {
        if cfg!(windows) {
            return false;
        }
        self.runner
            .run(Path::new("sudo"), &["-n", "true"], true)
            .await
            .is_ok()
    }

    async fn run_noninteractive(&self, script: &str) -> Result<()> {
        let result = if self.is_root() {
            self.runner
                .run(Path::new("/bin/sh"), &["-c", script], false)
                .await
        } else {
            self.runner
                .run(Path::new("sudo"), &["-n", "/bin/sh", "-c", script], false)
                .await
        };
        result.map(|_| ())
    }

    async fn run_interactive(&self, script: &str, reason: &str) -> Result<ElevationOutcome> {
        if cfg!(target_os = "macos") {
            let apple_script = osascript_command(script, reason);
            return match self
                .runner
                .run(Path::new("/usr/bin/osascript"), &["-e", &apple_script], true)
                .await
            {
                Ok(_) => Ok(ElevationOutcome::Completed),
                // userCanceledErr
                Err(VmError::Command { stderr, .. }) if stderr.contains("(-128)") => {
                    Ok(ElevationOutcome::Denied)
                }
                Err(e) => Err(e),
            };
        }

        if cfg!(target_os = "linux") {
            return match self
                .runner
                .run(Path::new("pkexec"), &["/bin/sh", "-c", script], true)
                .await
            {
                Ok(_) => Ok(ElevationOutcome::Completed),
                Err(VmError::Command {
                    code: Some(126 | 127),
                    ..
                }) => Ok(ElevationOutcome::Denied),
                Err(e) => Err(e),
            };
        }

        Err(VmError::PrivilegeDenied(
            "interactive elevation is not supported on this platform".to_string(),
        ))
    }
}

/// AppleScript that runs `script` through `/bin/sh` with an admin prompt.
pub(crate) fn osascript_command(script: &str, reason: &str) -> String {
    let shell = format!("/bin/sh -c '{}'", script);
    format!(
        "do shell script \"{}\" with prompt \"{}\" with administrator privileges",
        escape_applescript(&shell),
        escape_applescript(&format!("nodevm needs to {}.", reason))
    )
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
