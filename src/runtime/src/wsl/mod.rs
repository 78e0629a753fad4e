//! WSL2 strategy for Windows hosts.
//!
//! Two distributions are registered: `nodevm` holds the system and is
//! replaced wholesale on upgrade, `nodevm-data` holds user data and is
//! only ever created. Booting the VM means launching the distro's init
//! process and keeping it alive.

pub mod driver;
pub mod executor;

use crate::executor::{ExecOptions, GuestExecutor};
use crate::host_check::HostCapabilities;
use crate::lifecycle::{checkpoint, sealed, ActionGuard, BackendContext, BackendDeps, LifecycleCore, VmBackend};
use crate::lima::migrate::{self, ImageVersion, MigrationPlan};
use crate::paths::{find_in_dir, Paths, DATA_DISTRO_NAME, INSTANCE_NAME};
use crate::privilege::{Elevator, PrivilegeBroker};
use crate::process::CommandRunner;
use crate::readiness::StatusProbe;
use crate::services;
use async_trait::async_trait;
use driver::{WslDriver, WslExe};
use executor::WslExecutor;
use nodevm_core::config::BackendSettings;
use nodevm_core::error::{Result, VmError};
use nodevm_core::state::{Action, BackendState};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;

/// Init launched inside the distro; runs OpenRC and stays in the foreground.
pub const INIT_COMMAND: &[&str] = &["/usr/local/bin/nodevm-init"];

/// Tarball for the data distribution.
pub const DATA_TARBALL: &str = "data.tar";

const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WslBackend {
    core: LifecycleCore,
    ctx: Mutex<BackendContext>,
    paths: Paths,
    driver: Arc<dyn WslDriver>,
    executor: Arc<dyn GuestExecutor>,
    host: Arc<dyn HostCapabilities>,
    elevator: Arc<dyn Elevator>,
    status_probe: Arc<dyn StatusProbe>,
    init: Mutex<Option<Child>>,
    daemon_poll_interval: Duration,
}

/// The bundled system distro tarball and its version.
pub fn find_bundled_distro(dir: &std::path::Path) -> Result<(PathBuf, ImageVersion)> {
    find_in_dir(dir, |name| {
        name.ends_with(".tar") && ImageVersion::from_image_name(name).is_some()
    })?
    .and_then(|path| {
        let version = ImageVersion::from_image_name(&path.to_string_lossy())?;
        Some((path, version))
    })
    .ok_or_else(|| {
        VmError::fatal_with_hint(
            format!("No bundled distribution found in {}", dir.display()),
            "Reinstall nodevm",
        )
    })
}

impl WslBackend {
    pub fn new(deps: BackendDeps) -> Self {
        let runner = CommandRunner::new(deps.diagnostics.clone());
        let driver = Arc::new(WslExe::new(runner.clone()));
        let executor = Arc::new(WslExecutor::new(runner));
        Self::with_driver(deps, driver, executor)
    }

    pub fn with_driver(
        deps: BackendDeps,
        driver: Arc<dyn WslDriver>,
        executor: Arc<dyn GuestExecutor>,
    ) -> Self {
        Self {
            core: LifecycleCore::new(deps.events, deps.diagnostics),
            ctx: Mutex::new(BackendContext::default()),
            paths: deps.paths,
            driver,
            executor,
            host: deps.host,
            elevator: deps.elevator,
            status_probe: deps.status_probe,
            init: Mutex::new(None),
            daemon_poll_interval: DAEMON_POLL_INTERVAL,
        }
    }

    pub fn with_daemon_poll_interval(mut self, interval: Duration) -> Self {
        self.daemon_poll_interval = interval;
        self
    }

    fn init_running(&self) -> bool {
        let mut init = self.init.lock();
        match init.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(_) => {
                *init = None;
                false
            }
            None => false,
        }
    }

    async fn start_sequence(&self, guard: &ActionGuard) -> Result<()> {
        let settings = self.ctx.lock().settings.clone();
        let root = self.core.progress().begin(100);

        tokio::try_join!(
            root.action("Checking host architecture", 5, |_| {
                self.host.check_architecture()
            }),
            root.action("Checking WSL", 5, |_| self.driver.check_available()),
            root.action("Reconciling distributions", 25, |_| self.reconcile()),
        )?;
        checkpoint!(guard);

        root.action("Configuring administrator access", 5, |_| async {
            PrivilegeBroker::new(self.elevator.as_ref()).run(&[]).await?;
            Ok::<_, VmError>(())
        })
        .await?;
        checkpoint!(guard);

        root.action("Starting virtual machine", 30, |_| self.boot())
            .await?;
        checkpoint!(guard);

        root.action("Starting container engine", 15, |_| {
            services::start_container_daemon(self.executor.as_ref(), self.daemon_poll_interval)
        })
        .await?;
        checkpoint!(guard);

        root.action("Starting node", 15, |_| async {
            if !settings.node.enabled {
                return Ok(());
            }
            let online = services::start_node(
                self.executor.as_ref(),
                self.status_probe.as_ref(),
                &settings.node,
            )
            .await?;
            if !online {
                self.core.notify_warning(format!(
                    "Node did not come online after {} attempts",
                    settings.node.retries
                ));
            }
            Ok::<_, VmError>(())
        })
        .await?;
        checkpoint!(guard);

        self.core.set_state(BackendState::Started);
        Ok(())
    }

    /// Register missing distributions and replace an outdated system distro.
    async fn reconcile(&self) -> Result<()> {
        let resources = self.paths.wsl_resources();
        let (tarball, bundled) = find_bundled_distro(&resources)?;
        let distros = self.driver.list_distros().await?;

        if !distros.iter().any(|d| d == DATA_DISTRO_NAME) {
            let data = resources.join(DATA_TARBALL);
            if !data.exists() {
                return Err(VmError::fatal_with_hint(
                    format!("Missing data distribution tarball {}", data.display()),
                    "Reinstall nodevm",
                ));
            }
            self.driver
                .import(DATA_DISTRO_NAME, &self.paths.wsl_distro_dir(DATA_DISTRO_NAME), &data)
                .await?;
        }

        if distros.iter().any(|d| d == INSTANCE_NAME) {
            let Some(current) = self.driver.distro_version(INSTANCE_NAME).await? else {
                tracing::warn!("Installed distribution has no version, keeping it");
                return Ok(());
            };
            match migrate::compare(&bundled, &current)? {
                MigrationPlan::Upgrade { from, to } => {
                    tracing::info!(from = %from, to = %to, "Replacing WSL distribution");
                    self.kill_init().await;
                    self.driver.terminate(INSTANCE_NAME).await?;
                    self.driver.unregister(INSTANCE_NAME).await?;
                }
                MigrationPlan::Fresh | MigrationPlan::UpToDate => return Ok(()),
            }
        }

        self.driver
            .import(INSTANCE_NAME, &self.paths.wsl_distro_dir(INSTANCE_NAME), &tarball)
            .await
    }

    async fn boot(&self) -> Result<()> {
        if self.init_running() {
            tracing::info!("Distribution init already running");
            return Ok(());
        }
        let child = self.executor.spawn(ExecOptions::root(), INIT_COMMAND).await?;
        tracing::info!(pid = ?child.id(), "Distribution init started");
        *self.init.lock() = Some(child);
        Ok(())
    }

    async fn kill_init(&self) {
        let child = self.init.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill distribution init");
            }
        }
    }

    async fn stop_sequence(&self) -> Result<()> {
        self.core.set_state(BackendState::Stopping);
        let root = self.core.progress().begin(100);

        root.action("Stopping services", 40, |_| async {
            if self.init_running() {
                services::stop_services(self.executor.as_ref()).await;
            }
            self.kill_init().await;
            Ok::<_, VmError>(())
        })
        .await?;

        let terminated = root
            .action("Stopping virtual machine", 60, |_| async {
                // An unregistered distro has nothing to stop, and `wsl.exe`
                // refuses to terminate it.
                let registered = match self.driver.list_distros().await {
                    Ok(distros) => distros.iter().any(|d| d == INSTANCE_NAME),
                    Err(e) => {
                        tracing::debug!(error = %e, "Could not list distributions");
                        true
                    }
                };
                if !registered {
                    tracing::info!("Distribution not registered, nothing to terminate");
                    return Ok(());
                }
                self.driver.terminate(INSTANCE_NAME).await
            })
            .await;
        if let Err(e) = terminated {
            tracing::error!(error = %e, "Failed to terminate distribution");
            self.core.set_state(BackendState::Error);
            return Err(e);
        }
        Ok(())
    }
}

impl sealed::Sealed for WslBackend {}

#[async_trait]
impl VmBackend for WslBackend {
    fn name(&self) -> &'static str {
        "wsl"
    }

    fn core(&self) -> &LifecycleCore {
        &self.core
    }

    fn executor(&self) -> Arc<dyn GuestExecutor> {
        Arc::clone(&self.executor)
    }

    async fn start(&self, settings: &BackendSettings) -> Result<()> {
        let Some(guard) = self.core.begin(Action::Starting) else {
            return Ok(());
        };
        self.ctx.lock().settings = settings.clone();
        self.core.set_state(BackendState::Starting);

        let result = self.start_sequence(&guard).await;
        if !guard.is_current() {
            if let Err(e) = result {
                tracing::info!(error = %e, "Interrupted start failed");
            }
            return Ok(());
        }
        self.core.settle_start(result)
    }

    async fn stop(&self) -> Result<()> {
        let Some(_guard) = self.core.begin(Action::Stopping) else {
            return Ok(());
        };
        self.stop_sequence().await?;
        self.core.set_state(BackendState::Stopped);
        Ok(())
    }

    /// Unregisters both distributions, user data included.
    async fn del(&self) -> Result<()> {
        let Some(_guard) = self.core.begin(Action::Stopping) else {
            return Ok(());
        };
        self.stop_sequence().await?;

        let distros = self.driver.list_distros().await?;
        for name in [INSTANCE_NAME, DATA_DISTRO_NAME] {
            if distros.iter().any(|d| d == name) {
                if let Err(e) = self.driver.unregister(name).await {
                    self.core.set_state(BackendState::Error);
                    return Err(e);
                }
            }
        }
        self.core.set_state(BackendState::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::ElevationOutcome;
    use crate::process::DiagnosticsLog;
    use crate::testing::{FakeElevator, FakeExecutor, FakeHost, FakeStatusProbe, FakeWslDriver};
    use nodevm_core::event::BackendEvents;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        driver: Arc<FakeWslDriver>,
        exec: Arc<FakeExecutor>,
        elevator: Arc<FakeElevator>,
        host: Arc<FakeHost>,
        backend: WslBackend,
    }

    fn fixture(driver: FakeWslDriver) -> Fixture {
        fixture_with_host(driver, FakeHost::ok())
    }

    fn fixture_with_host(driver: FakeWslDriver, host: FakeHost) -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().join("home"), dir.path().join("resources"));
        std::fs::create_dir_all(paths.wsl_resources()).unwrap();
        std::fs::write(paths.wsl_resources().join("nodevm-distro-0.1.2.rd5.tar"), "system").unwrap();
        std::fs::write(paths.wsl_resources().join(DATA_TARBALL), "data").unwrap();

        let driver = Arc::new(driver);
        let exec = Arc::new(FakeExecutor::new());
        let elevator = Arc::new(FakeElevator::interactive(ElevationOutcome::Completed));
        let host = Arc::new(host);
        let deps = BackendDeps {
            paths,
            events: BackendEvents::new(1024),
            diagnostics: DiagnosticsLog::new(),
            host: host.clone(),
            elevator: elevator.clone(),
            status_probe: Arc::new(FakeStatusProbe::online_after(1)),
        };
        let backend = WslBackend::with_driver(deps, driver.clone(), exec.clone())
            .with_daemon_poll_interval(Duration::from_millis(1));
        Fixture {
            _dir: dir,
            driver,
            exec,
            elevator,
            host,
            backend,
        }
    }

    fn settings() -> BackendSettings {
        let mut settings = BackendSettings::default();
        settings.node.retries = 2;
        settings.node.retry_delay_ms = 1;
        settings
    }

    #[test]
    fn test_find_bundled_distro() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DATA_TARBALL), "").unwrap();
        std::fs::write(dir.path().join("nodevm-distro-0.2.0.rd1.tar"), "").unwrap();
        let (path, version) = find_bundled_distro(dir.path()).unwrap();
        assert!(path.ends_with("nodevm-distro-0.2.0.rd1.tar"));
        assert_eq!(version.to_string(), "0.2.0.rd1");
    }

    #[tokio::test]
    async fn test_fresh_start_imports_both_distros() {
        let f = fixture(FakeWslDriver::new(true));
        f.backend.start(&settings()).await.unwrap();

        assert_eq!(f.backend.state(), BackendState::Started);
        assert_eq!(
            f.driver.installed_distros(),
            vec!["nodevm".to_string(), "nodevm-data".to_string()]
        );
        assert!(f
            .exec
            .commands()
            .iter()
            .any(|c| c == "[root] spawn /usr/local/bin/nodevm-init"));
        assert_eq!(f.elevator.total_calls(), 0);

        let progress = f.backend.core().progress().snapshot();
        assert_eq!(progress.current, progress.max);
    }

    #[tokio::test]
    async fn test_upgrade_reimports_system_and_keeps_data() {
        let f = fixture(
            FakeWslDriver::new(true)
                .with_distro("nodevm", Some("0.1.2.rd3"))
                .with_distro("nodevm-data", None),
        );
        f.backend.start(&settings()).await.unwrap();

        assert_eq!(*f.driver.unregistered.lock(), vec!["nodevm".to_string()]);
        assert_eq!(
            *f.driver.imports.lock(),
            vec![("nodevm".to_string(), "nodevm-distro-0.1.2.rd5.tar".to_string())]
        );
    }

    #[tokio::test]
    async fn test_current_distro_is_left_alone() {
        let f = fixture(
            FakeWslDriver::new(true)
                .with_distro("nodevm", Some("0.1.2.rd5"))
                .with_distro("nodevm-data", None),
        );
        f.backend.start(&settings()).await.unwrap();
        assert!(f.driver.imports.lock().is_empty());
        assert!(f.driver.unregistered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_newer_installed_distro_is_fatal() {
        let f = fixture(
            FakeWslDriver::new(true)
                .with_distro("nodevm", Some("0.3.0.rd1"))
                .with_distro("nodevm-data", None),
        );
        let err = f.backend.start(&settings()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.backend.state(), BackendState::Error);
        assert!(f.driver.unregistered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_overlaps_host_checks() {
        let f = fixture_with_host(
            FakeWslDriver::new(true),
            FakeHost::ok().with_check_delay(Duration::from_millis(50)),
        );
        let s = settings();

        let (result, imported_early) = tokio::join!(f.backend.start(&s), async {
            while f.driver.imports.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            !f.host.architecture_checked.load(std::sync::atomic::Ordering::SeqCst)
        });
        result.unwrap();
        assert!(imported_early);
        assert_eq!(f.backend.state(), BackendState::Started);
    }

    #[tokio::test]
    async fn test_foreign_architecture_is_fatal() {
        let f = fixture_with_host(FakeWslDriver::new(true), FakeHost::foreign_architecture());
        let err = f.backend.start(&settings()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.backend.state(), BackendState::Error);
        assert!(!f.exec.commands().iter().any(|c| c.contains("spawn")));
    }

    #[tokio::test]
    async fn test_missing_wsl_is_fatal() {
        let f = fixture(FakeWslDriver::new(false));
        let err = f.backend.start(&settings()).await.unwrap_err();
        assert!(err.hint().is_some());
        assert_eq!(f.backend.state(), BackendState::Error);
        assert!(f.driver.imports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_terminates_distribution() {
        let f = fixture(FakeWslDriver::new(true));
        f.backend.start(&settings()).await.unwrap();
        f.exec.fail_on("rc-service");

        f.backend.stop().await.unwrap();
        assert_eq!(f.backend.state(), BackendState::Stopped);
        assert_eq!(f.driver.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!f.backend.init_running());
    }

    #[tokio::test]
    async fn test_terminate_failure_ends_in_error() {
        let f = fixture(FakeWslDriver::new(true));
        f.backend.start(&settings()).await.unwrap();
        f.driver.fail_terminate();

        assert!(f.backend.stop().await.is_err());
        assert_eq!(f.backend.state(), BackendState::Error);
    }

    #[tokio::test]
    async fn test_stop_on_fresh_host_is_noop() {
        let f = fixture(FakeWslDriver::new(true));

        f.backend.stop().await.unwrap();
        assert_eq!(f.backend.state(), BackendState::Stopped);
        assert_eq!(f.driver.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_without_system_distro_still_removes_data() {
        let f = fixture(FakeWslDriver::new(true).with_distro("nodevm-data", None));

        f.backend.del().await.unwrap();
        assert_eq!(f.backend.state(), BackendState::Stopped);
        assert_eq!(*f.driver.unregistered.lock(), vec!["nodevm-data".to_string()]);
        assert!(f.driver.installed_distros().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unregisters_everything() {
        let f = fixture(FakeWslDriver::new(true));
        f.backend.start(&settings()).await.unwrap();

        f.backend.del().await.unwrap();
        assert!(f.driver.installed_distros().is_empty());
        assert_eq!(f.backend.state(), BackendState::Stopped);
    }
}
