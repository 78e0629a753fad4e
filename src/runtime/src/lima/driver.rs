//! Host-side control of the Lima instance.

use crate::paths::INSTANCE_NAME;
use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Broken,
}

impl InstanceStatus {
    fn parse(s: &str) -> Self {
        match s {
            "Running" => InstanceStatus::Running,
            "Stopped" => InstanceStatus::Stopped,
            _ => InstanceStatus::Broken,
        }
    }
}

/// Operations on the Lima instance that run on the host.
#[async_trait]
pub trait LimaDriver: Send + Sync {
    /// `None` when the instance does not exist.
    async fn status(&self) -> Result<Option<InstanceStatus>>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Unregister the instance and remove its directory.
    async fn delete(&self) -> Result<()>;

    /// Image format of `disk` as reported by `qemu-img` (`qcow2`, `raw`).
    async fn disk_format(&self, disk: &Path) -> Result<String>;

    /// Convert `disk` to raw in place.
    async fn convert_to_raw(&self, disk: &Path) -> Result<()>;

    /// Stop the `socket_vmnet` daemon owning `pidfile`.
    async fn stop_network_daemon(&self, pidfile: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    format: String,
}

/// [`LimaDriver`] backed by `limactl` and `qemu-img`.
pub struct Limactl {
    runner: CommandRunner,
    limactl: PathBuf,
}

impl Limactl {
    /// `runner` must already carry `LIMA_HOME`.
    pub fn new(runner: CommandRunner, limactl: PathBuf) -> Self {
        Self { runner, limactl }
    }

    /// `qemu-img` next to a bundled `limactl`, else from `$PATH`.
    fn qemu_img(&self) -> PathBuf {
        self.limactl
            .parent()
            .map(|dir| dir.join("qemu-img"))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from("qemu-img"))
    }
}

/// `limactl list --json` prints one JSON object per line.
pub(crate) fn parse_list(output: &str, name: &str) -> Result<Option<InstanceStatus>> {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let entry: ListEntry = serde_json::from_str(line)?;
        if entry.name == name {
            return Ok(Some(InstanceStatus::parse(&entry.status)));
        }
    }
    Ok(None)
}

#[async_trait]
impl LimaDriver for Limactl {
    async fn status(&self) -> Result<Option<InstanceStatus>> {
        let out = self
            .runner
            .run(&self.limactl, &["list", "--json"], false)
            .await?;
        parse_list(&out.stdout, INSTANCE_NAME)
    }

    async fn start(&self) -> Result<()> {
        tracing::info!(vm = INSTANCE_NAME, "Starting Lima instance");
        self.runner
            .run(&self.limactl, &["start", "--tty=false", INSTANCE_NAME], false)
            .await
            .map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!(vm = INSTANCE_NAME, "Stopping Lima instance");
        self.runner
            .run(&self.limactl, &["stop", INSTANCE_NAME], false)
            .await
            .map(|_| ())
    }

    async fn delete(&self) -> Result<()> {
        tracing::info!(vm = INSTANCE_NAME, "Deleting Lima instance");
        self.runner
            .run(&self.limactl, &["delete", "--force", INSTANCE_NAME], false)
            .await
            .map(|_| ())
    }

    async fn disk_format(&self, disk: &Path) -> Result<String> {
        let disk = disk.to_string_lossy();
        let out = self
            .runner
            .run(&self.qemu_img(), &["info", "--output=json", &disk], false)
            .await?;
        let info: QemuImgInfo = serde_json::from_str(&out.stdout)?;
        Ok(info.format)
    }

    async fn convert_to_raw(&self, disk: &Path) -> Result<()> {
        let raw = disk.with_extension("raw");
        let (src, dst) = (disk.to_string_lossy(), raw.to_string_lossy());
        tracing::info!(disk = %src, "Converting disk to raw format");

        self.runner
            .run(&self.qemu_img(), &["convert", "-O", "raw", &src, &dst], false)
            .await?;
        tokio::fs::rename(&raw, disk).await.map_err(|e| {
            VmError::Other(format!("failed to replace {} with raw image: {}", src, e))
        })
    }

    async fn stop_network_daemon(&self, pidfile: &str) -> Result<()> {
        if !Path::new(pidfile).exists() {
            return Ok(());
        }
        self.runner
            .run(
                Path::new("sudo"),
                &["-n", "/usr/bin/pkill", "-F", pidfile],
                true,
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let output = r#"{"name":"default","status":"Stopped","dir":"/x/default"}
{"name":"nodevm","status":"Running","dir":"/x/nodevm","sshLocalPort":60022}
"#;
        assert_eq!(
            parse_list(output, "nodevm").unwrap(),
            Some(InstanceStatus::Running)
        );
        assert_eq!(
            parse_list(output, "default").unwrap(),
            Some(InstanceStatus::Stopped)
        );
        assert_eq!(parse_list(output, "other").unwrap(), None);
        assert_eq!(parse_list("", "nodevm").unwrap(), None);
    }

    #[test]
    fn test_parse_list_broken_and_garbage() {
        let broken = r#"{"name":"nodevm","status":"Broken"}"#;
        assert_eq!(
            parse_list(broken, "nodevm").unwrap(),
            Some(InstanceStatus::Broken)
        );
        assert!(parse_list("not json", "nodevm").is_err());
    }
}
