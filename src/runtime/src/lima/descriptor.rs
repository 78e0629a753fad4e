//! Lima instance descriptor (`lima.yaml`) and the three-way merge.
//!
//! Every field is optional so the same type describes the desired layer,
//! the file on disk and the built-in defaults. Keys this model does not know
//! are carried in `extra` and survive a rewrite.

use nodevm_core::config::{MountType, VmType};
use nodevm_core::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<VmType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageEntry>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// e.g. `4GiB`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<MountType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision: Option<Vec<Provision>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub containerd: Option<Containerd>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_resolver: Option<HostResolver>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_forwards: Option<Vec<PortForward>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<NetworkEntry>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_dot_ssh_pub_key: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    /// `system` or `user`
    pub mode: String,
    pub script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Containerd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResolver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    #[serde(default, rename = "guestIP", skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_socket: Option<String>,
    #[serde(default, rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<bool>,
}

/// One `networks:` entry; `lima` names a network from `networks.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lima: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl VmDescriptor {
    /// Read `path`, treating a missing or malformed file as absent.
    pub fn load(path: &Path) -> Option<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read VM descriptor, regenerating");
                return None;
            }
        };
        match serde_yaml::from_str(&data) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed VM descriptor, regenerating");
                None
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Location of the first base image, if any.
    pub fn base_image(&self) -> Option<&str> {
        self.images
            .as_ref()
            .and_then(|images| images.first())
            .map(|image| image.location.as_str())
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh
            .as_ref()
            .and_then(|ssh| ssh.local_port)
            .filter(|port| *port != 0)
    }
}

/// Three-way merge with precedence `desired > existing > default`.
///
/// Scalars and lists are taken whole from the highest layer that sets them.
/// Nested records merge field by field; `hostResolver.hosts` and unknown
/// keys merge key by key.
pub fn merge(desired: &VmDescriptor, existing: &VmDescriptor, default: &VmDescriptor) -> VmDescriptor {
    fn pick<T: Clone>(d: &Option<T>, e: &Option<T>, f: &Option<T>) -> Option<T> {
        d.clone().or_else(|| e.clone()).or_else(|| f.clone())
    }

    fn layered<K: Ord + Clone, V: Clone>(layers: [&BTreeMap<K, V>; 3]) -> BTreeMap<K, V> {
        let mut out = BTreeMap::new();
        // Lowest precedence first so higher layers overwrite.
        for layer in layers.iter().rev() {
            out.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    let ssh = match (&desired.ssh, &existing.ssh, &default.ssh) {
        (None, None, None) => None,
        (d, e, f) => {
            let (d, e, f) = (
                d.clone().unwrap_or_default(),
                e.clone().unwrap_or_default(),
                f.clone().unwrap_or_default(),
            );
            Some(SshConfig {
                local_port: pick(&d.local_port, &e.local_port, &f.local_port),
                load_dot_ssh_pub_key: pick(
                    &d.load_dot_ssh_pub_key,
                    &e.load_dot_ssh_pub_key,
                    &f.load_dot_ssh_pub_key,
                ),
            })
        }
    };

    let containerd = match (&desired.containerd, &existing.containerd, &default.containerd) {
        (None, None, None) => None,
        (d, e, f) => {
            let (d, e, f) = (
                d.clone().unwrap_or_default(),
                e.clone().unwrap_or_default(),
                f.clone().unwrap_or_default(),
            );
            Some(Containerd {
                system: pick(&d.system, &e.system, &f.system),
                user: pick(&d.user, &e.user, &f.user),
            })
        }
    };

    let host_resolver = match (&desired.host_resolver, &existing.host_resolver, &default.host_resolver) {
        (None, None, None) => None,
        (d, e, f) => {
            let (d, e, f) = (
                d.clone().unwrap_or_default(),
                e.clone().unwrap_or_default(),
                f.clone().unwrap_or_default(),
            );
            Some(HostResolver {
                enabled: pick(&d.enabled, &e.enabled, &f.enabled),
                hosts: layered([&d.hosts, &e.hosts, &f.hosts]),
            })
        }
    };

    VmDescriptor {
        vm_type: pick(&desired.vm_type, &existing.vm_type, &default.vm_type),
        images: pick(&desired.images, &existing.images, &default.images),
        cpus: pick(&desired.cpus, &existing.cpus, &default.cpus),
        memory: pick(&desired.memory, &existing.memory, &default.memory),
        disk: pick(&desired.disk, &existing.disk, &default.disk),
        mounts: pick(&desired.mounts, &existing.mounts, &default.mounts),
        mount_type: pick(&desired.mount_type, &existing.mount_type, &default.mount_type),
        ssh,
        provision: pick(&desired.provision, &existing.provision, &default.provision),
        containerd,
        host_resolver,
        port_forwards: pick(
            &desired.port_forwards,
            &existing.port_forwards,
            &default.port_forwards,
        ),
        networks: pick(&desired.networks, &existing.networks, &default.networks),
        extra: layered([&desired.extra, &existing.extra, &default.extra]),
    }
}
