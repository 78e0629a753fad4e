//! Host-side control of WSL distributions through `wsl.exe`.

use crate::lima::migrate::ImageVersion;
use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};
use std::path::{Path, PathBuf};

/// File inside the distro recording the version it was built from.
pub const RELEASE_FILE: &str = "/etc/nodevm-release";

#[async_trait]
pub trait WslDriver: Send + Sync {
    /// Fails with a fatal error when WSL is not installed or not enabled.
    async fn check_available(&self) -> Result<()>;

    /// Names of the registered distributions.
    async fn list_distros(&self) -> Result<Vec<String>>;

    /// Version recorded in the distro, `None` when it has no release file.
    async fn distro_version(&self, name: &str) -> Result<Option<ImageVersion>>;

    /// Register `tarball` as distribution `name` with its disk under `install_dir`.
    async fn import(&self, name: &str, install_dir: &Path, tarball: &Path) -> Result<()>;

    async fn unregister(&self, name: &str) -> Result<()>;

    async fn terminate(&self, name: &str) -> Result<()>;
}

pub struct WslExe {
    runner: CommandRunner,
    wsl: PathBuf,
}

impl WslExe {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            wsl: PathBuf::from("wsl.exe"),
        }
    }
}

/// Distribution names from `wsl --list --quiet`.
pub fn parse_distro_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl WslDriver for WslExe {
    async fn check_available(&self) -> Result<()> {
        self.runner
            .run(&self.wsl, &["--status"], true)
            .await
            .map(|_| ())
            .map_err(|e| {
                VmError::fatal_with_hint(
                    format!("WSL is not available: {}", e),
                    "Install WSL with `wsl --install` and reboot",
                )
            })
    }

    async fn list_distros(&self) -> Result<Vec<String>> {
        let out = self.runner.run(&self.wsl, &["--list", "--quiet"], false).await?;
        Ok(parse_distro_list(&out.stdout))
    }

    async fn distro_version(&self, name: &str) -> Result<Option<ImageVersion>> {
        match self
            .runner
            .run(&self.wsl, &["-d", name, "--exec", "cat", RELEASE_FILE], true)
            .await
        {
            Ok(out) => Ok(ImageVersion::parse(out.stdout.trim())),
            Err(e) => {
                tracing::debug!(distro = name, error = %e, "No release file");
                Ok(None)
            }
        }
    }

    async fn import(&self, name: &str, install_dir: &Path, tarball: &Path) -> Result<()> {
        tokio::fs::create_dir_all(install_dir).await?;
        let install_dir = install_dir.to_string_lossy();
        let tarball = tarball.to_string_lossy();
        tracing::info!(distro = name, tarball = %tarball, "Importing WSL distribution");
        self.runner
            .run(
                &self.wsl,
                &["--import", name, &install_dir, &tarball, "--version", "2"],
                false,
            )
            .await
            .map(|_| ())
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        self.runner
            .run(&self.wsl, &["--unregister", name], false)
            .await
            .map(|_| ())
    }

    async fn terminate(&self, name: &str) -> Result<()> {
        self.runner
            .run(&self.wsl, &["--terminate", name], false)
            .await
            .map(|_| ())
    }
}
