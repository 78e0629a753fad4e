//! `nodevm status` command.

use clap::Args;
use serde::Serialize;

use nodevm_runtime::lima::descriptor::VmDescriptor;
use nodevm_runtime::lima::driver::{InstanceStatus, LimaDriver, Limactl};
use nodevm_runtime::paths::INSTANCE_NAME;
use nodevm_runtime::wsl::driver::{WslDriver, WslExe};
use nodevm_runtime::{CommandRunner, DiagnosticsLog, HostPlatform, Paths};

use crate::output::new_table;

#[derive(Args)]
pub struct StatusArgs {
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    backend: &'static str,
    instance: String,
    ssh_port: Option<u16>,
    cpus: Option<u32>,
    memory: Option<String>,
    home: String,
}

pub async fn execute(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let platform = HostPlatform::current().ok_or_else(nodevm_runtime::unsupported_platform)?;
    let paths = Paths::detect()?;
    let report = collect(platform, &paths).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut table = new_table(&["FIELD", "VALUE"]);
    table.add_row(vec!["Backend".to_string(), report.backend.to_string()]);
    table.add_row(vec!["Instance".to_string(), report.instance]);
    if let Some(port) = report.ssh_port {
        table.add_row(vec!["SSH port".to_string(), port.to_string()]);
    }
    if let Some(cpus) = report.cpus {
        table.add_row(vec!["CPUs".to_string(), cpus.to_string()]);
    }
    if let Some(memory) = report.memory {
        table.add_row(vec!["Memory".to_string(), memory]);
    }
    table.add_row(vec!["Home".to_string(), report.home]);
    println!("{table}");
    Ok(())
}

async fn collect(
    platform: HostPlatform,
    paths: &Paths,
) -> Result<StatusReport, nodevm_core::VmError> {
    let runner = CommandRunner::new(DiagnosticsLog::new());
    let home = paths.home.display().to_string();

    if platform == HostPlatform::Windows {
        let distros = WslExe::new(runner).list_distros().await?;
        return Ok(StatusReport {
            backend: "wsl",
            instance: describe_distro(&distros),
            ssh_port: None,
            cpus: None,
            memory: None,
            home,
        });
    }

    let limactl = Limactl::new(runner.with_env("LIMA_HOME", paths.lima_home()), paths.limactl());
    let descriptor = VmDescriptor::load(&paths.lima_config());
    Ok(StatusReport {
        backend: "lima",
        instance: describe_instance(limactl.status().await?),
        ssh_port: descriptor.as_ref().and_then(|d| d.ssh_port()),
        cpus: descriptor.as_ref().and_then(|d| d.cpus),
        memory: descriptor.and_then(|d| d.memory),
        home,
    })
}

fn describe_instance(status: Option<InstanceStatus>) -> String {
    match status {
        Some(InstanceStatus::Running) => "running",
        Some(InstanceStatus::Stopped) => "stopped",
        Some(InstanceStatus::Broken) => "broken",
        None => "not created",
    }
    .to_string()
}

fn describe_distro(distros: &[String]) -> String {
    if distros.iter().any(|d| d == INSTANCE_NAME) {
        "registered".to_string()
    } else {
        "not created".to_string()
    }
}
