//! Filesystem locations used by the backends.
//!
//! Everything lives under the nodevm home directory (`~/.nodevm`, or
//! `$NODEVM_HOME`). Bundled artifacts (base images, the WSL distro tarball,
//! the network helper) come from the resources directory, which defaults to
//! `resources/` next to the executable and can be overridden with
//! `$NODEVM_RESOURCES`.

use nodevm_core::error::{Result, VmError};
use std::path::{Path, PathBuf};

/// Name of the Lima instance and of the WSL distribution.
pub const INSTANCE_NAME: &str = "nodevm";

/// Name of the WSL distribution holding user data.
pub const DATA_DISTRO_NAME: &str = "nodevm-data";

/// System location of the installed network helper bundle (macOS).
pub const NETWORK_HELPER_INSTALL_DIR: &str = "/opt/nodevm/socket_vmnet";

/// Run directory for network helper sockets and pid files (macOS).
pub const NETWORK_RUN_DIR: &str = "/private/var/run/nodevm-lima";

/// Sudoers policy written for the network helper (macOS).
pub const SUDOERS_PATH: &str = "/private/etc/sudoers.d/zzzzz-nodevm-lima";

#[derive(Debug, Clone)]
pub struct Paths {
    /// nodevm home directory
    pub home: PathBuf,

    /// Bundled resources
    pub resources: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>, resources: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            resources: resources.into(),
        }
    }

    /// Resolve locations from the environment.
    pub fn detect() -> Result<Self> {
        let home = nodevm_home().ok_or_else(|| {
            VmError::ConfigError("cannot determine the home directory".to_string())
        })?;

        let resources = match std::env::var("NODEVM_RESOURCES") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("resources")))
                .unwrap_or_else(|| home.join("resources")),
        };

        Ok(Self::new(home, resources))
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join("settings.yaml")
    }

    /// Scratch space for files staged before a privileged copy.
    pub fn staging_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    /// `LIMA_HOME` for the managed instance.
    pub fn lima_home(&self) -> PathBuf {
        self.home.join("lima")
    }

    pub fn lima_instance_dir(&self) -> PathBuf {
        self.lima_home().join(INSTANCE_NAME)
    }

    /// Instance descriptor (`lima.yaml`).
    pub fn lima_config(&self) -> PathBuf {
        self.lima_instance_dir().join("lima.yaml")
    }

    /// Read-only base disk inside the instance directory.
    pub fn lima_basedisk(&self) -> PathBuf {
        self.lima_instance_dir().join("basedisk")
    }

    /// Copy-on-write user data disk inside the instance directory.
    pub fn lima_diffdisk(&self) -> PathBuf {
        self.lima_instance_dir().join("diffdisk")
    }

    /// Lima network catalog (`_config/networks.yaml`).
    pub fn lima_networks_config(&self) -> PathBuf {
        self.lima_home().join("_config").join("networks.yaml")
    }

    /// `limactl` binary: the bundled copy when present, otherwise `$PATH`.
    pub fn limactl(&self) -> PathBuf {
        let bundled = self.resources.join("lima").join("bin").join("limactl");
        if bundled.exists() {
            bundled
        } else {
            PathBuf::from("limactl")
        }
    }

    /// Directory holding the bundled base image(s).
    pub fn images_dir(&self) -> PathBuf {
        self.resources.join("images")
    }

    /// Unpacked network helper bundle shipped with the product.
    pub fn network_helper_bundle(&self) -> PathBuf {
        self.resources.join("socket_vmnet")
    }

    /// Directory holding the WSL distro tarballs.
    pub fn wsl_resources(&self) -> PathBuf {
        self.resources.join("wsl")
    }

    /// Install location for a WSL distribution's virtual disk.
    pub fn wsl_distro_dir(&self, distro: &str) -> PathBuf {
        self.home.join("wsl").join(distro)
    }
}

/// Find the first entry of `dir` whose file name satisfies `accept`.
///
/// Entries are visited in name order so the choice is stable.
pub fn find_in_dir(dir: &Path, accept: impl Fn(&str) -> bool) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    names.sort();

    Ok(names.into_iter().find(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(&accept)
            .unwrap_or(false)
    }))
}

/// Get the nodevm home directory (~/.nodevm).
fn nodevm_home() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("NODEVM_HOME") {
        return Some(PathBuf::from(home));
    }

    dirs::home_dir().map(|h| h.join(".nodevm"))
}
