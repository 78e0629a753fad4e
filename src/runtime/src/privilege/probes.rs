//! macOS privilege probes for Lima's shared/bridged networking.

use super::{quote, PrivilegeProbe, SudoCommand};
use crate::lima::network::NetworkDescriptor;
use crate::paths::Paths;
use async_trait::async_trait;
use nodevm_core::error::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Probes needed before Lima can start `socket_vmnet`.
pub fn macos_probes(paths: &Paths, networks: &NetworkDescriptor) -> Vec<Box<dyn PrivilegeProbe>> {
    vec![
        Box::new(NetworkHelperProbe::new(
            paths.network_helper_bundle(),
            crate::paths::NETWORK_HELPER_INSTALL_DIR,
        )),
        Box::new(RunDirProbe::new(&networks.paths.var_run)),
        Box::new(SudoersProbe::new(
            &networks.paths.sudoers,
            networks.sudoers(),
            paths.staging_dir(),
        )),
    ]
}

/// Installs the bundled `socket_vmnet` under a root-owned system path.
///
/// Skipped when every bundled file already exists there with the same
/// sha256.
pub struct NetworkHelperProbe {
    bundle: PathBuf,
    install_dir: PathBuf,
}

impl NetworkHelperProbe {
    pub fn new(bundle: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle: bundle.into(),
            install_dir: install_dir.into(),
        }
    }

    fn up_to_date(&self) -> Result<bool> {
        let mut files = Vec::new();
        list_files(&self.bundle, Path::new(""), &mut files)?;
        for rel in files {
            let installed = self.install_dir.join(&rel);
            if !installed.is_file() {
                return Ok(false);
            }
            if sha256_file(&self.bundle.join(&rel))? != sha256_file(&installed)? {
                tracing::debug!(file = %rel.display(), "Network helper file differs");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl PrivilegeProbe for NetworkHelperProbe {
    fn name(&self) -> &str {
        "network-helper"
    }

    async fn check(&self) -> Result<Option<SudoCommand>> {
        if !self.bundle.is_dir() {
            tracing::warn!(bundle = %self.bundle.display(), "Network helper is not bundled, skipping install");
            return Ok(None);
        }
        if self.up_to_date()? {
            return Ok(None);
        }

        let install = self.install_dir.display().to_string();
        let parent = self
            .install_dir
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Some(SudoCommand {
            reason: "install the network helper".to_string(),
            commands: vec![
                format!("mkdir -p {}", quote(&parent)),
                format!("rm -rf {}", quote(&install)),
                format!(
                    "cp -R {} {}",
                    quote(&self.bundle.display().to_string()),
                    quote(&install)
                ),
                format!("chown -R root:wheel {}", quote(&install)),
                format!("chmod -R go-w {}", quote(&install)),
            ],
            paths: vec![install],
        }))
    }
}

/// Keeps the socket run directory owned by root and not writable by others.
pub struct RunDirProbe {
    path: PathBuf,
}

impl RunDirProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Owned by root, no group or other write bit.
pub(crate) fn run_dir_is_safe(uid: u32, mode: u32) -> bool {
    uid == 0 && mode & 0o022 == 0
}

#[async_trait]
impl PrivilegeProbe for RunDirProbe {
    fn name(&self) -> &str {
        "run-dir"
    }

    async fn check(&self) -> Result<Option<SudoCommand>> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = std::fs::metadata(&self.path) {
                if meta.is_dir() && run_dir_is_safe(meta.uid(), meta.mode()) {
                    return Ok(None);
                }
            }
        }

        let path = self.path.display().to_string();
        Ok(Some(SudoCommand {
            reason: "create the network run directory".to_string(),
            commands: vec![
                format!("mkdir -p {}", quote(&path)),
                format!("chown root:daemon {}", quote(&path)),
                format!("chmod 755 {}", quote(&path)),
            ],
            paths: vec![path],
        }))
    }
}

/// Keeps the sudoers policy byte-identical to the generated one.
///
/// The policy is written world-readable so this probe can compare it
/// without elevation.
pub struct SudoersProbe {
    path: PathBuf,
    contents: String,
    staging_dir: PathBuf,
}

impl SudoersProbe {
    pub fn new(path: impl Into<PathBuf>, contents: String, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            contents,
            staging_dir: staging_dir.into(),
        }
    }
}

#[async_trait]
impl PrivilegeProbe for SudoersProbe {
    fn name(&self) -> &str {
        "sudoers"
    }

    async fn check(&self) -> Result<Option<SudoCommand>> {
        match std::fs::read(&self.path) {
            Ok(existing) if existing == self.contents.as_bytes() => return Ok(None),
            Ok(_) => tracing::debug!(path = %self.path.display(), "Sudoers policy is stale"),
            Err(e) => tracing::debug!(path = %self.path.display(), error = %e, "Sudoers policy unreadable"),
        }

        std::fs::create_dir_all(&self.staging_dir)?;
        let staged = self.staging_dir.join("sudoers");
        std::fs::write(&staged, &self.contents)?;

        let target = self.path.display().to_string();
        let parent = self
            .path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(Some(SudoCommand {
            reason: "configure passwordless networking".to_string(),
            commands: vec![
                format!("mkdir -p {}", quote(&parent)),
                format!(
                    "cp {} {}",
                    quote(&staged.display().to_string()),
                    quote(&target)
                ),
                format!("chown root:wheel {}", quote(&target)),
                format!("chmod 0444 {}", quote(&target)),
            ],
            paths: vec![target],
        }))
    }
}

fn list_files(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(root.join(rel))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let child = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            list_files(root, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}
