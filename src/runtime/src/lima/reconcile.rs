//! Builds the desired Lima descriptor and writes the merged result.

use super::descriptor::{
    merge, Containerd, HostResolver, ImageEntry, Mount, NetworkEntry, PortForward, Provision,
    SshConfig, VmDescriptor,
};
use super::network::{bridged_name, SHARED_NETWORK};
use nodevm_core::config::BackendSettings;
use nodevm_core::error::{Result, VmError};
use std::collections::BTreeMap;
use std::path::Path;

const PROVISION_SCRIPT: &str = "#!/bin/sh\nset -o errexit\nrc-update add docker default\n";

/// Built-in lowest layer of the merge.
pub fn default_descriptor() -> VmDescriptor {
    let mut hosts = BTreeMap::new();
    hosts.insert(
        "host.docker.internal".to_string(),
        "host.lima.internal".to_string(),
    );

    VmDescriptor {
        cpus: Some(2),
        memory: Some("4GiB".to_string()),
        disk: Some("100GiB".to_string()),
        ssh: Some(SshConfig {
            local_port: None,
            load_dot_ssh_pub_key: Some(false),
        }),
        provision: Some(vec![Provision {
            mode: "system".to_string(),
            script: PROVISION_SCRIPT.to_string(),
        }]),
        containerd: Some(Containerd {
            system: Some(false),
            user: Some(false),
        }),
        host_resolver: Some(HostResolver {
            enabled: Some(true),
            hosts,
        }),
        port_forwards: Some(vec![PortForward {
            guest_ip: None,
            guest_port: None,
            guest_socket: Some("/var/run/docker.sock".to_string()),
            host_ip: None,
            host_port: None,
            host_socket: Some("{{.Dir}}/sock/docker.sock".to_string()),
            ignore: None,
        }]),
        ..Default::default()
    }
}

/// Network entries for the instance; empty unless admin access is usable.
pub fn network_entries(settings: &BackendSettings, admin_access: bool) -> Vec<NetworkEntry> {
    if !admin_access {
        return Vec::new();
    }
    let lima = match &settings.bridged_interface {
        Some(interface) => bridged_name(interface),
        None => SHARED_NETWORK.to_string(),
    };
    vec![NetworkEntry {
        lima: Some(lima),
        interface: Some("vznodevm0".to_string()),
    }]
}

/// Highest layer of the merge, derived from the user's settings.
pub fn desired_descriptor(
    settings: &BackendSettings,
    admin_access: bool,
    ssh_port: u16,
    base_image: &Path,
) -> VmDescriptor {
    VmDescriptor {
        vm_type: Some(settings.vm_type),
        images: Some(vec![ImageEntry {
            location: base_image.display().to_string(),
            arch: Some(std::env::consts::ARCH.to_string()),
        }]),
        cpus: Some(settings.cpus),
        memory: Some(format!("{}GiB", settings.memory_gib)),
        mounts: Some(vec![
            Mount {
                location: "~".to_string(),
                mount_point: None,
                writable: Some(true),
            },
            Mount {
                location: "/tmp/nodevm".to_string(),
                mount_point: None,
                writable: Some(true),
            },
        ]),
        mount_type: Some(settings.mount_type),
        ssh: Some(SshConfig {
            local_port: Some(ssh_port),
            load_dot_ssh_pub_key: None,
        }),
        host_resolver: Some(HostResolver {
            enabled: None,
            hosts: settings.hosts.clone(),
        }),
        networks: Some(network_entries(settings, admin_access)),
        ..Default::default()
    }
}

/// Pick the SSH port for this start.
///
/// A running VM keeps the port in its descriptor. Otherwise the port cached
/// for this process is reused, and only the first start binds a fresh one.
pub fn resolve_ssh_port(
    existing: Option<&VmDescriptor>,
    running: bool,
    cached: &mut Option<u16>,
) -> Result<u16> {
    if running {
        if let Some(port) = existing.and_then(|d| d.ssh_port()) {
            *cached = Some(port);
            return Ok(port);
        }
    }
    if let Some(port) = *cached {
        return Ok(port);
    }

    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    tracing::debug!(port, "Allocated SSH port");
    *cached = Some(port);
    Ok(port)
}

/// Merge the three layers.
pub fn reconcile(
    desired: &VmDescriptor,
    existing: Option<&VmDescriptor>,
) -> VmDescriptor {
    let empty = VmDescriptor::default();
    merge(desired, existing.unwrap_or(&empty), &default_descriptor())
}

/// Replace `path` with `contents` via a temporary file and rename.
///
/// Returns `false` without touching the file when it already holds
/// exactly these bytes.
pub fn write_atomic(path: &Path, contents: &str) -> Result<bool> {
    if let Ok(existing) = std::fs::read(path) {
        if existing == contents.as_bytes() {
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VmError::ConfigError(format!(
                "failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, contents).map_err(|e| {
        VmError::ConfigError(format!("failed to write tmp file {}: {}", tmp.display(), e))
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        VmError::ConfigError(format!(
            "failed to rename {} → {}: {}",
            tmp.display(),
            path.display(),
            e
        ))
    })?;
    Ok(true)
}
