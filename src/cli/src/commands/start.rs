//! `nodevm start` command.

use clap::Args;
use nodevm_core::{BackendSettings, BackendState, MountType, VmType};

use crate::backend::{load_settings, Session};

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Number of virtual CPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in GiB
    #[arg(long)]
    pub memory: Option<u32>,

    /// Hypervisor: qemu or vz
    #[arg(long, value_parser = parse_vm_type)]
    pub vm_type: Option<VmType>,

    /// Directory sharing: reverse-sshfs, 9p or virtiofs
    #[arg(long, value_parser = parse_mount_type)]
    pub mount_type: Option<MountType>,

    /// Bridge the VM onto this host interface
    #[arg(long)]
    pub bridged: Option<String>,

    /// Never ask for administrator access
    #[arg(long)]
    pub no_admin: bool,
}

fn parse_vm_type(s: &str) -> Result<VmType, String> {
    match s {
        "qemu" => Ok(VmType::Qemu),
        "vz" => Ok(VmType::Vz),
        other => Err(format!("unknown VM type '{other}' (expected qemu or vz)")),
    }
}

fn parse_mount_type(s: &str) -> Result<MountType, String> {
    match s {
        "reverse-sshfs" => Ok(MountType::ReverseSshfs),
        "9p" => Ok(MountType::NineP),
        "virtiofs" => Ok(MountType::Virtiofs),
        other => Err(format!(
            "unknown mount type '{other}' (expected reverse-sshfs, 9p or virtiofs)"
        )),
    }
}

impl StartArgs {
    /// Apply the flags on top of the stored settings.
    pub fn apply(&self, mut settings: BackendSettings) -> BackendSettings {
        if let Some(cpus) = self.cpus {
            settings.cpus = cpus;
        }
        if let Some(memory) = self.memory {
            settings.memory_gib = memory;
        }
        if let Some(vm_type) = self.vm_type {
            settings.vm_type = vm_type;
        }
        if let Some(mount_type) = self.mount_type {
            settings.mount_type = mount_type;
        }
        if let Some(bridged) = &self.bridged {
            settings.bridged_interface = Some(bridged.clone());
        }
        if self.no_admin {
            settings.admin_access = false;
        }
        settings
    }
}

pub async fn execute(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open()?;
    let settings = args.apply(load_settings(&session.paths)?);
    settings.validate()?;

    let printer = session.watch();
    let result = run_start(&session, &settings, false).await;
    printer.abort();
    result
}

/// Start (or reset) the backend, stopping it again on Ctrl-C.
pub(crate) async fn run_start(
    session: &Session,
    settings: &BackendSettings,
    reset: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = session.backend.as_ref();
    let operation = async {
        if reset {
            backend.reset(settings).await
        } else {
            backend.start(settings).await
        }
    };

    let interrupted = tokio::select! {
        result = operation => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        eprintln!("Interrupted, stopping the VM...");
        backend.core().interrupt();
        backend.stop().await?;
        return Err("start interrupted".into());
    }

    match backend.state() {
        BackendState::Started => {
            println!("VM started ({})", backend.name());
            Ok(())
        }
        state => {
            let diagnostics = backend.core().diagnostics();
            if let Some(command) = diagnostics.last_command {
                eprintln!("Last command: {command}");
            }
            Err(format!("VM did not start (state: {state})").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides_only_given_flags() {
        let stored = BackendSettings {
            cpus: 6,
            memory_gib: 12,
            ..Default::default()
        };
        let args = StartArgs {
            memory: Some(4),
            vm_type: Some(VmType::Vz),
            no_admin: true,
            ..Default::default()
        };
        let settings = args.apply(stored);
        assert_eq!(settings.cpus, 6);
        assert_eq!(settings.memory_gib, 4);
        assert_eq!(settings.vm_type, VmType::Vz);
        assert!(!settings.admin_access);
    }

    #[test]
    fn test_parse_types() {
        assert_eq!(parse_vm_type("vz").unwrap(), VmType::Vz);
        assert!(parse_vm_type("hyperv").is_err());
        assert_eq!(parse_mount_type("9p").unwrap(), MountType::NineP);
        assert!(parse_mount_type("nfs").is_err());
    }
}
