use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Desired backend configuration, owned by the caller.
///
/// A snapshot is cloned into the backend at `start()`; later edits by the
/// caller do not affect an operation already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendSettings {
    /// Number of virtual CPUs
    pub cpus: u32,

    /// Memory in GiB
    pub memory_gib: u32,

    /// How host directories are shared with the guest
    pub mount_type: MountType,

    /// Hypervisor used by the VM manager
    pub vm_type: VmType,

    /// Whether the user allows elevated operations (bridged/shared networking)
    pub admin_access: bool,

    /// Bridged interface to expose to the guest (requires admin access)
    pub bridged_interface: Option<String>,

    /// Host-resolver overrides (hostname → address)
    pub hosts: BTreeMap<String, String>,

    /// Embedded node process configuration
    pub node: NodeSettings,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_gib: 4,
            mount_type: MountType::default(),
            vm_type: VmType::default(),
            admin_access: true,
            bridged_interface: None,
            hosts: BTreeMap::new(),
            node: NodeSettings::default(),
        }
    }
}

impl BackendSettings {
    /// Load settings from a YAML file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|e| {
            VmError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;

        let settings: Self = serde_yaml::from_str(&data).map_err(|e| {
            VmError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the host cannot satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(VmError::ConfigError("cpus must be at least 1".to_string()));
        }
        if self.memory_gib == 0 {
            return Err(VmError::ConfigError(
                "memory must be at least 1 GiB".to_string(),
            ));
        }

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let host_gib = sys.total_memory() / (1024 * 1024 * 1024);
        if host_gib > 0 && u64::from(self.memory_gib) > host_gib {
            return Err(VmError::ConfigError(format!(
                "requested {} GiB of memory but the host only has {} GiB",
                self.memory_gib, host_gib
            )));
        }

        if self.vm_type == VmType::Vz && self.mount_type == MountType::NineP {
            return Err(VmError::ConfigError(
                "9p mounts are not supported with the vz VM type".to_string(),
            ));
        }

        Ok(())
    }
}

/// Host directory sharing mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MountType {
    #[default]
    ReverseSshfs,
    #[serde(rename = "9p")]
    NineP,
    Virtiofs,
}

impl fmt::Display for MountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountType::ReverseSshfs => write!(f, "reverse-sshfs"),
            MountType::NineP => write!(f, "9p"),
            MountType::Virtiofs => write!(f, "virtiofs"),
        }
    }
}

/// VM manager hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Qemu,
    Vz,
}

impl VmType {
    /// `vz` can only boot raw disks; qemu uses qcow2.
    pub fn requires_raw_disk(&self) -> bool {
        matches!(self, VmType::Vz)
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmType::Qemu => write!(f, "qemu"),
            VmType::Vz => write!(f, "vz"),
        }
    }
}

/// Embedded node process configuration.
///
/// The status endpoint and method are injected; they are not part of the
/// backend contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeSettings {
    /// Install and start the node process
    pub enabled: bool,

    /// Loopback status endpoint (JSON-RPC over HTTP)
    pub status_url: String,

    /// JSON-RPC method returning `{ "online": bool }`
    pub status_method: String,

    /// Config file location inside the guest
    pub config_path: String,

    /// Flag to patch into the node config after first readiness
    pub patch_flag: Option<ConfigFlag>,

    /// Readiness attempts before giving up
    pub retries: u32,

    /// Delay between readiness attempts
    pub retry_delay_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            status_url: "http://127.0.0.1:6061/rpc".to_string(),
            status_method: "node_status".to_string(),
            config_path: "/etc/conf.d/node".to_string(),
            patch_flag: None,
            retries: 30,
            retry_delay_ms: 1000,
        }
    }
}

/// A single `KEY=value` line in the node config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFlag {
    pub key: String,
    pub value: String,
}
