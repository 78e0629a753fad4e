//! Guest command and file primitives shared by every backend.

use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};
use std::path::Path;
use tokio::process::Child;

/// Options accepted by every guest operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Return stdout to the caller
    pub capture: bool,

    /// Run as root inside the guest (not on the host)
    pub root: bool,

    /// Failure is anticipated (polling, capability probes): still returned,
    /// but logged at debug level only
    pub expect_failure: bool,
}

impl ExecOptions {
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    pub fn root() -> Self {
        Self {
            root: true,
            ..Default::default()
        }
    }

    pub fn with_root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn expecting_failure(mut self) -> Self {
        self.expect_failure = true;
        self
    }
}

/// Uniform guest access, independent of the backend.
#[async_trait]
pub trait GuestExecutor: Send + Sync {
    /// Run `argv` inside the guest. Returns stdout when `opts.capture` is
    /// set, an empty string otherwise.
    async fn exec_command(&self, opts: ExecOptions, argv: &[&str]) -> Result<String>;

    /// Start a long-lived guest process.
    async fn spawn(&self, opts: ExecOptions, argv: &[&str]) -> Result<Child>;

    /// Copy a host file into the guest.
    async fn copy_file_in(&self, opts: ExecOptions, host: &Path, guest: &str) -> Result<()>;

    /// Copy a guest file out to the host.
    async fn copy_file_out(&self, opts: ExecOptions, guest: &str, host: &Path) -> Result<()>;

    async fn read_file(&self, opts: ExecOptions, guest: &str) -> Result<String> {
        self.exec_command(opts.with_capture(), &["cat", guest]).await
    }

    /// Write `contents` to `guest` without ever exposing a partial file.
    ///
    /// The data is staged under `/tmp`, given its final `mode`, then moved
    /// into place (as root when `opts.root` is set).
    async fn write_file(
        &self,
        opts: ExecOptions,
        guest: &str,
        contents: &str,
        mode: u32,
    ) -> Result<()> {
        let token = format!("nodevm-{}", uuid::Uuid::new_v4());
        let host_tmp = std::env::temp_dir().join(&token);
        let staged = format!("/tmp/{}", token);

        tokio::fs::write(&host_tmp, contents).await?;
        let copied = self
            .copy_file_in(
                ExecOptions {
                    root: false,
                    ..opts
                },
                &host_tmp,
                &staged,
            )
            .await;
        let _ = tokio::fs::remove_file(&host_tmp).await;
        copied?;

        let plain = ExecOptions {
            capture: false,
            ..opts
        };
        let mode = format!("{:o}", mode);
        let result = match self
            .exec_command(plain, &["chmod", mode.as_str(), staged.as_str()])
            .await
        {
            Ok(_) => self
                .exec_command(plain, &["mv", "-f", staged.as_str(), guest])
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = self
                .exec_command(plain.expecting_failure(), &["rm", "-f", staged.as_str()])
                .await;
        }
        result.map_err(|e| match e {
            VmError::Command { .. } => VmError::Other(format!("failed to write {}: {}", guest, e)),
            other => other,
        })
    }
}
