//! Lima network catalog (`_config/networks.yaml`) and its sudoers policy.

use crate::paths::{NETWORK_HELPER_INSTALL_DIR, NETWORK_RUN_DIR, SUDOERS_PATH};
use nodevm_core::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SHARED_NETWORK: &str = "shared";
pub const HOST_NETWORK: &str = "host";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub paths: NetworkPaths,
    pub group: String,
    pub networks: BTreeMap<String, NetworkDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPaths {
    #[serde(rename = "socketVMNet")]
    pub socket_vmnet: String,
    pub var_run: String,
    pub sudoers: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Host,
    Shared,
    Bridged,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Host => "host",
            NetworkMode::Shared => "shared",
            NetworkMode::Bridged => "bridged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDef {
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl NetworkDef {
    fn subnet(mode: NetworkMode, third_octet: u8) -> Self {
        Self {
            mode,
            gateway: Some(format!("192.168.{}.1", third_octet)),
            dhcp_end: Some(format!("192.168.{}.254", third_octet)),
            netmask: Some("255.255.255.0".to_string()),
            interface: None,
        }
    }

    fn bridged(interface: &str) -> Self {
        Self {
            mode: NetworkMode::Bridged,
            gateway: None,
            dhcp_end: None,
            netmask: None,
            interface: Some(interface.to_string()),
        }
    }
}

/// Name of the bridged network for `interface`.
pub fn bridged_name(interface: &str) -> String {
    format!("bridged_{}", interface)
}

impl NetworkDescriptor {
    /// Catalog with `host`, `shared` and one bridged network per interface.
    pub fn generate(interfaces: &[String]) -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            SHARED_NETWORK.to_string(),
            NetworkDef::subnet(NetworkMode::Shared, 205),
        );
        networks.insert(
            HOST_NETWORK.to_string(),
            NetworkDef::subnet(NetworkMode::Host, 206),
        );
        for interface in interfaces {
            networks.insert(bridged_name(interface), NetworkDef::bridged(interface));
        }

        Self {
            paths: NetworkPaths {
                socket_vmnet: format!("{}/bin/socket_vmnet", NETWORK_HELPER_INSTALL_DIR),
                var_run: NETWORK_RUN_DIR.to_string(),
                sudoers: SUDOERS_PATH.to_string(),
            },
            group: "everyone".to_string(),
            networks,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn pidfile(&self, name: &str) -> String {
        format!("{}/{}_socket_vmnet.pid", self.paths.var_run, name)
    }

    /// Pid files of every network daemon that may be running.
    pub fn pidfiles(&self) -> Vec<String> {
        self.networks.keys().map(|name| self.pidfile(name)).collect()
    }

    /// Sudoers policy allowing exactly the helper start and stop commands.
    ///
    /// Laid out the way `limactl sudoers` prints it: no header, every rule
    /// followed by a blank line, networks in name order. `limactl` compares
    /// the installed file with its own rendering before starting a network.
    pub fn sudoers(&self) -> String {
        let group = &self.group;
        let var_run = &self.paths.var_run;
        let mut out = String::new();

        let _ = write!(
            out,
            "%{} ALL=(root:wheel) NOPASSWD:NOSETENV: /bin/mkdir -m 775 -p {}\n\n",
            group, var_run
        );

        for (name, def) in &self.networks {
            let pidfile = self.pidfile(name);
            let mut start = format!(
                "{} --pidfile={} --socket-group={} --vmnet-mode={}",
                self.paths.socket_vmnet,
                pidfile,
                group,
                def.mode.as_str()
            );
            match def.mode {
                NetworkMode::Bridged => {
                    if let Some(interface) = &def.interface {
                        let _ = write!(start, " --vmnet-interface={}", interface);
                    }
                }
                NetworkMode::Host | NetworkMode::Shared => {
                    if let Some(gateway) = &def.gateway {
                        let _ = write!(start, " --vmnet-gateway={}", gateway);
                    }
                    if let Some(dhcp_end) = &def.dhcp_end {
                        let _ = write!(start, " --vmnet-dhcp-end={}", dhcp_end);
                    }
                    if let Some(netmask) = &def.netmask {
                        let _ = write!(start, " --vmnet-mask={}", netmask);
                    }
                }
            }
            let _ = write!(start, " {}/socket_vmnet.{}", var_run, name);

            let _ = writeln!(out, "# Manage \"{}\" network", name);
            let _ = write!(
                out,
                "%{} ALL=(root:wheel) NOPASSWD:NOSETENV: {}, /usr/bin/pkill -F {}\n\n",
                group, start, pidfile
            );
        }
        out
    }
}
