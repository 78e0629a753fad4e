//! OpenRC service control and the embedded node process setup.

use crate::executor::{ExecOptions, GuestExecutor};
use crate::readiness::{poll_forever, poll_until, StatusProbe};
use nodevm_core::config::{ConfigFlag, NodeSettings};
use nodevm_core::error::Result;
use std::time::Duration;

pub const CONTAINER_DAEMON: &str = "docker";
pub const NODE_SERVICE: &str = "nodevm-node";

const NODE_INIT_SCRIPT_PATH: &str = "/etc/init.d/nodevm-node";

fn node_init_script(config_path: &str) -> String {
    format!(
        r#"#!/sbin/openrc-run
name="nodevm node"
command="/usr/local/bin/nodevm-node"
command_args="--config {config_path}"
command_background=true
pidfile="/run/${{RC_SVCNAME}}.pid"
output_log="/var/log/${{RC_SVCNAME}}.log"
error_log="/var/log/${{RC_SVCNAME}}.log"

depend() {{
    need net
    after docker
}}
"#
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }

    /// `rc-service` guard that makes the action a no-op when already done.
    fn guard(&self) -> Option<&'static str> {
        match self {
            ServiceAction::Start => Some("--ifnotstarted"),
            ServiceAction::Stop => Some("--ifstarted"),
            ServiceAction::Restart => None,
        }
    }
}

/// `rc-service [--ifstarted|--ifnotstarted] <service> <action>` as root.
pub async fn rc_service(
    exec: &dyn GuestExecutor,
    service: &str,
    action: ServiceAction,
) -> Result<()> {
    let mut argv = vec!["rc-service"];
    if let Some(guard) = action.guard() {
        argv.push(guard);
    }
    argv.push(service);
    argv.push(action.as_str());

    tracing::debug!(service, action = action.as_str(), "Guest service control");
    exec.exec_command(ExecOptions::root(), &argv).await?;
    Ok(())
}

/// Start the container daemon and wait until `docker info` answers.
///
/// The rest of startup is pointless without the daemon, so this waits
/// without a retry budget.
pub async fn start_container_daemon(exec: &dyn GuestExecutor, interval: Duration) -> Result<()> {
    rc_service(exec, CONTAINER_DAEMON, ServiceAction::Start).await?;
    poll_forever(interval, move || async move {
        exec.exec_command(
            ExecOptions::root().expecting_failure(),
            &["docker", "info"],
        )
        .await
        .map(|_| true)
    })
    .await;
    tracing::info!("Container daemon ready");
    Ok(())
}

/// Install the node service if missing, start it and wait for it.
///
/// Returns whether the node reported online within its retry budget. When
/// a patch flag is configured and differs from the guest config, the flag
/// is written, the service restarted and readiness polled again.
pub async fn start_node(
    exec: &dyn GuestExecutor,
    probe: &dyn StatusProbe,
    node: &NodeSettings,
) -> Result<bool> {
    install_node(exec, node).await?;
    rc_service(exec, NODE_SERVICE, ServiceAction::Start).await?;

    let delay = Duration::from_millis(node.retry_delay_ms);
    let online = poll_until(node.retries, delay, move || probe.online(node)).await;
    if !online {
        return Ok(false);
    }

    let Some(flag) = &node.patch_flag else {
        return Ok(true);
    };
    let current = exec
        .read_file(ExecOptions::root(), &node.config_path)
        .await?;
    let patched = patch_config(&current, flag);
    if patched == current {
        return Ok(true);
    }

    tracing::info!(key = %flag.key, "Patching node config");
    exec.write_file(ExecOptions::root(), &node.config_path, &patched, 0o644)
        .await?;
    rc_service(exec, NODE_SERVICE, ServiceAction::Restart).await?;
    Ok(poll_until(node.retries, delay, move || probe.online(node)).await)
}

async fn install_node(exec: &dyn GuestExecutor, node: &NodeSettings) -> Result<()> {
    let installed = exec
        .exec_command(
            ExecOptions::default().expecting_failure(),
            &["test", "-f", NODE_INIT_SCRIPT_PATH],
        )
        .await
        .is_ok();
    if !installed {
        tracing::info!("Installing node service");
        exec.write_file(
            ExecOptions::root(),
            NODE_INIT_SCRIPT_PATH,
            &node_init_script(&node.config_path),
            0o755,
        )
        .await?;
    }

    let has_config = exec
        .exec_command(
            ExecOptions::default().expecting_failure(),
            &["test", "-f", node.config_path.as_str()],
        )
        .await
        .is_ok();
    if !has_config {
        exec.write_file(
            ExecOptions::root(),
            &node.config_path,
            "# nodevm node configuration\n",
            0o644,
        )
        .await?;
    }
    Ok(())
}

/// Stop the node then the container daemon, logging failures.
pub async fn stop_services(exec: &dyn GuestExecutor) {
    for service in [NODE_SERVICE, CONTAINER_DAEMON] {
        if let Err(e) = rc_service(exec, service, ServiceAction::Stop).await {
            tracing::warn!(service, error = %e, "Failed to stop guest service, continuing");
        }
    }
}

/// Set `KEY=value` in a shell-style config, replacing an existing line.
pub fn patch_config(config: &str, flag: &ConfigFlag) -> String {
    let prefix = format!("{}=", flag.key);
    let line = format!("{}={}", flag.key, flag.value);
    let mut found = false;

    let mut lines: Vec<String> = config
        .lines()
        .map(|l| {
            if l.trim_start().starts_with(&prefix) {
                found = true;
                line.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, FakeStatusProbe};

    fn flag(key: &str, value: &str) -> ConfigFlag {
        ConfigFlag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn fast_node() -> NodeSettings {
        NodeSettings {
            retries: 3,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_config_replaces_and_appends() {
        let config = "A=1\nSYNC=off\n";
        assert_eq!(patch_config(config, &flag("SYNC", "on")), "A=1\nSYNC=on\n");
        assert_eq!(patch_config(config, &flag("B", "2")), "A=1\nSYNC=off\nB=2\n");
        assert_eq!(patch_config(config, &flag("A", "1")), config);
    }

    #[tokio::test]
    async fn test_rc_service_guards() {
        let exec = FakeExecutor::new();
        rc_service(&exec, "docker", ServiceAction::Start).await.unwrap();
        rc_service(&exec, "docker", ServiceAction::Stop).await.unwrap();
        rc_service(&exec, "docker", ServiceAction::Restart).await.unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                "[root] rc-service --ifnotstarted docker start",
                "[root] rc-service --ifstarted docker stop",
                "[root] rc-service docker restart",
            ]
        );
    }

    #[tokio::test]
    async fn test_container_daemon_waits_for_info() {
        let exec = FakeExecutor::new();
        exec.fail_times("docker info", 3);
        start_container_daemon(&exec, Duration::from_millis(1))
            .await
            .unwrap();
        let infos = exec
            .commands()
            .iter()
            .filter(|c| c.ends_with("docker info"))
            .count();
        assert_eq!(infos, 4);
    }

    #[tokio::test]
    async fn test_start_node_installs_and_polls() {
        let exec = FakeExecutor::new();
        let probe = FakeStatusProbe::online_after(2);
        let online = start_node(&exec, &probe, &fast_node()).await.unwrap();

        assert!(online);
        let script = exec.file(NODE_INIT_SCRIPT_PATH).unwrap();
        assert!(script.contains("command_args=\"--config /etc/conf.d/node\""));
        assert!(script.contains("pidfile=\"/run/${RC_SVCNAME}.pid\""));
        assert_eq!(
            exec.file("/etc/conf.d/node").as_deref(),
            Some("# nodevm node configuration\n")
        );
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_start_node_reports_exhaustion() {
        let exec = FakeExecutor::new();
        let probe = FakeStatusProbe::failing();
        let online = start_node(&exec, &probe, &fast_node()).await.unwrap();
        assert!(!online);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test]
    async fn test_patch_flag_restarts_and_repolls() {
        let exec = FakeExecutor::new();
        exec.put_file("/etc/conf.d/node", "SYNC=off\n");
        let probe = FakeStatusProbe::online_after(1);
        let node = NodeSettings {
            patch_flag: Some(flag("SYNC", "on")),
            ..fast_node()
        };

        assert!(start_node(&exec, &probe, &node).await.unwrap());
        assert_eq!(exec.file("/etc/conf.d/node").as_deref(), Some("SYNC=on\n"));
        assert!(exec
            .commands()
            .contains(&"[root] rc-service nodevm-node restart".to_string()));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_stop_services_continues_past_failures() {
        let exec = FakeExecutor::new();
        exec.fail_on("rc-service --ifstarted nodevm-node");
        stop_services(&exec).await;
        assert!(exec
            .commands()
            .contains(&"[root] rc-service --ifstarted docker stop".to_string()));
    }
}
