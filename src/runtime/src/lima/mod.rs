//! Lima strategy for macOS and Linux hosts.
//!
//! The instance lives under `<home>/lima/nodevm`. Its `lima.yaml` is
//! regenerated on every start from the user's settings merged over
//! whatever the file already holds, so hand edits to fields nodevm does not
//! own survive. On macOS, shared and bridged networking go through
//! `socket_vmnet`, which needs a one-time privileged install.

pub mod descriptor;
pub mod driver;
pub mod executor;
pub mod migrate;
pub mod network;
pub mod reconcile;

use crate::executor::GuestExecutor;
use crate::host_check::HostCapabilities;
use crate::lifecycle::{checkpoint, sealed, ActionGuard, BackendContext, BackendDeps, HostPlatform, LifecycleCore, VmBackend};
use crate::paths::Paths;
use crate::privilege::{macos_probes, BrokerOutcome, Elevator, PrivilegeBroker, PrivilegeProbe};
use crate::process::CommandRunner;
use crate::readiness::StatusProbe;
use crate::services;
use async_trait::async_trait;
use descriptor::VmDescriptor;
use driver::{InstanceStatus, LimaDriver, Limactl};
use executor::LimaExecutor;
use migrate::MigrationPlan;
use network::NetworkDescriptor;
use nodevm_core::config::BackendSettings;
use nodevm_core::error::{Result, VmError};
use nodevm_core::state::{Action, BackendState};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builds the privilege probes for a network catalog.
pub type ProbeFactory =
    Arc<dyn Fn(&Paths, &NetworkDescriptor) -> Vec<Box<dyn PrivilegeProbe>> + Send + Sync>;

const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct LimaBackend {
    core: LifecycleCore,
    ctx: Mutex<BackendContext>,
    paths: Paths,
    /// Whether networking goes through `socket_vmnet` (macOS only)
    privileged_networking: bool,
    driver: Arc<dyn LimaDriver>,
    executor: Arc<dyn GuestExecutor>,
    host: Arc<dyn HostCapabilities>,
    elevator: Arc<dyn Elevator>,
    status_probe: Arc<dyn StatusProbe>,
    probes: ProbeFactory,
    daemon_poll_interval: Duration,
}

impl LimaBackend {
    pub fn new(platform: HostPlatform, deps: BackendDeps) -> Self {
        let runner = CommandRunner::new(deps.diagnostics.clone())
            .with_env("LIMA_HOME", deps.paths.lima_home());
        let limactl = deps.paths.limactl();
        let driver = Arc::new(Limactl::new(runner.clone(), limactl.clone()));
        let executor = Arc::new(LimaExecutor::new(runner, limactl));
        Self::with_driver(platform == HostPlatform::MacOs, deps, driver, executor)
    }

    /// Backend over an explicit driver and guest executor.
    pub fn with_driver(
        privileged_networking: bool,
        deps: BackendDeps,
        driver: Arc<dyn LimaDriver>,
        executor: Arc<dyn GuestExecutor>,
    ) -> Self {
        let probes: ProbeFactory = if privileged_networking {
            Arc::new(macos_probes)
        } else {
            Arc::new(|_: &Paths, _: &NetworkDescriptor| Vec::new())
        };
        Self {
            core: LifecycleCore::new(deps.events, deps.diagnostics),
            ctx: Mutex::new(BackendContext::default()),
            paths: deps.paths,
            privileged_networking,
            driver,
            executor,
            host: deps.host,
            elevator: deps.elevator,
            status_probe: deps.status_probe,
            probes,
            daemon_poll_interval: DAEMON_POLL_INTERVAL,
        }
    }

    pub fn with_probes(mut self, probes: ProbeFactory) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_daemon_poll_interval(mut self, interval: Duration) -> Self {
        self.daemon_poll_interval = interval;
        self
    }

    pub fn context(&self) -> BackendContext {
        self.ctx.lock().clone()
    }

    fn admin_access(&self, settings: &BackendSettings) -> bool {
        settings.admin_access && self.ctx.lock().admin_access
    }

    fn network_catalog(&self, settings: &BackendSettings) -> NetworkDescriptor {
        let interfaces: Vec<String> = settings.bridged_interface.iter().cloned().collect();
        NetworkDescriptor::generate(&interfaces)
    }

    async fn start_sequence(&self, guard: &ActionGuard) -> Result<()> {
        let settings = self.ctx.lock().settings.clone();
        let networks = self.network_catalog(&settings);
        let root = self.core.progress().begin(100);

        tokio::try_join!(
            root.action("Checking host architecture", 5, |_| {
                self.host.check_architecture()
            }),
            root.action("Checking virtualization support", 5, |_| async {
                let support = self.host.check_virtualization().await?;
                tracing::debug!(backend = %support.backend, "Virtualization available");
                Ok::<_, VmError>(())
            }),
            root.action("Reconciling configuration", 15, |_| {
                self.reconcile(&settings, &networks)
            }),
        )?;
        checkpoint!(guard);

        root.action("Configuring administrator access", 10, |_| {
            self.configure_privileges(&settings, &networks)
        })
        .await?;
        checkpoint!(guard);

        let status = self.driver.status().await?;
        let status = root
            .action("Checking disk format", 5, |_| {
                self.convert_disk_if_needed(&settings, status)
            })
            .await?;
        checkpoint!(guard);

        root.action("Starting virtual machine", 30, |_| async {
            if status == Some(InstanceStatus::Running) {
                tracing::info!("VM already running");
                return Ok(());
            }
            self.driver.start().await
        })
        .await?;
        checkpoint!(guard);

        root.action("Starting container engine", 15, |_| {
            services::start_container_daemon(self.executor.as_ref(), self.daemon_poll_interval)
        })
        .await?;
        checkpoint!(guard);

        root.action("Starting node", 15, |_| self.start_node(&settings))
            .await?;
        checkpoint!(guard);

        self.core.set_state(BackendState::Started);
        Ok(())
    }

    /// Bring `lima.yaml` and `networks.yaml` in line with `settings`,
    /// migrating the base disk first when the bundled image is newer.
    async fn reconcile(&self, settings: &BackendSettings, networks: &NetworkDescriptor) -> Result<()> {
        let mut running = self.driver.status().await? == Some(InstanceStatus::Running);
        let (bundled, version) = migrate::find_bundled_image(&self.paths.images_dir())?;
        let existing = VmDescriptor::load(&self.paths.lima_config());

        let on_disk = existing.as_ref().and_then(|d| d.base_image());
        if let MigrationPlan::Upgrade { from, to } = migrate::plan(&version, on_disk)? {
            tracing::info!(from = %from, to = %to, "Migrating base disk");
            if running {
                self.driver.stop().await?;
                running = false;
            }
            migrate::replace_basedisk(&bundled, &self.paths.lima_basedisk()).await?;
        }

        self.write_descriptor(settings, existing.as_ref(), running, &bundled)?;
        if self.privileged_networking {
            reconcile::write_atomic(&self.paths.lima_networks_config(), &networks.to_yaml()?)?;
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        settings: &BackendSettings,
        existing: Option<&VmDescriptor>,
        running: bool,
        base_image: &Path,
    ) -> Result<()> {
        let admin = self.privileged_networking && self.admin_access(settings);
        let port = reconcile::resolve_ssh_port(existing, running, &mut self.ctx.lock().ssh_port)?;
        let desired = reconcile::desired_descriptor(settings, admin, port, base_image);
        let merged = reconcile::reconcile(&desired, existing);
        if reconcile::write_atomic(&self.paths.lima_config(), &merged.to_yaml()?)? {
            tracing::info!(path = %self.paths.lima_config().display(), "Wrote VM descriptor");
        }
        Ok(())
    }

    async fn configure_privileges(
        &self,
        settings: &BackendSettings,
        networks: &NetworkDescriptor,
    ) -> Result<()> {
        if !self.privileged_networking || !self.admin_access(settings) {
            return Ok(());
        }

        let probes = (self.probes)(&self.paths, networks);
        match PrivilegeBroker::new(self.elevator.as_ref()).run(&probes).await? {
            BrokerOutcome::Degraded => {
                self.ctx.lock().admin_access = false;
                self.core.notify_warning(
                    "Administrator access was declined; shared and bridged networking are disabled",
                );
                let running = self.driver.status().await? == Some(InstanceStatus::Running);
                let (bundled, _) = migrate::find_bundled_image(&self.paths.images_dir())?;
                let existing = VmDescriptor::load(&self.paths.lima_config());
                self.write_descriptor(settings, existing.as_ref(), running, &bundled)
            }
            BrokerOutcome::Skipped | BrokerOutcome::Elevated => Ok(()),
        }
    }

    /// The VZ driver boots raw disks only. Returns the instance status
    /// after any stop the conversion needed.
    async fn convert_disk_if_needed(
        &self,
        settings: &BackendSettings,
        status: Option<InstanceStatus>,
    ) -> Result<Option<InstanceStatus>> {
        let disk = self.paths.lima_diffdisk();
        if !settings.vm_type.requires_raw_disk() || !disk.exists() {
            return Ok(status);
        }
        let format = self.driver.disk_format(&disk).await?;
        if format == "raw" {
            return Ok(status);
        }

        tracing::info!(format = %format, "Converting disk to raw");
        if status == Some(InstanceStatus::Running) {
            self.driver.stop().await?;
        }
        self.driver.convert_to_raw(&disk).await?;
        Ok(Some(InstanceStatus::Stopped))
    }

    async fn start_node(&self, settings: &BackendSettings) -> Result<()> {
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
        Ok(())
    }

    /// Stop services, network daemons and the instance.
    ///
    /// Everything before the instance stop is best effort. A failed
    /// instance stop leaves the backend in `Error`.
    async fn stop_sequence(&self) -> Result<Option<InstanceStatus>> {
        self.core.set_state(BackendState::Stopping);
        let root = self.core.progress().begin(100);

        let status = match self.driver.status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Could not query VM status, stopping anyway");
                Some(InstanceStatus::Broken)
            }
        };
        let live = matches!(status, Some(InstanceStatus::Running | InstanceStatus::Broken));

        root.action("Stopping services", 30, |_| async {
            if status == Some(InstanceStatus::Running) {
                services::stop_services(self.executor.as_ref()).await;
            }
            Ok::<_, VmError>(())
        })
        .await?;

        root.action("Stopping network daemons", 10, |_| async {
            if self.privileged_networking {
                let settings = self.ctx.lock().settings.clone();
                for pidfile in self.network_catalog(&settings).pidfiles() {
                    if let Err(e) = self.driver.stop_network_daemon(&pidfile).await {
                        tracing::warn!(pidfile = %pidfile, error = %e, "Failed to stop network daemon");
                    }
                }
            }
            Ok::<_, VmError>(())
        })
        .await?;

        let stopped = root
            .action("Stopping virtual machine", 60, |_| async {
                if live {
                    self.driver.stop().await
                } else {
                    Ok(())
                }
            })
            .await;

        if let Err(e) = stopped {
            tracing::error!(error = %e, "Failed to stop VM");
            self.core.set_state(BackendState::Error);
            return Err(e);
        }
        Ok(status)
    }
}

impl sealed::Sealed for LimaBackend {}

#[async_trait]
impl VmBackend for LimaBackend {
    fn name(&self) -> &'static str {
        "lima"
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

    async fn del(&self) -> Result<()> {
        let Some(_guard) = self.core.begin(Action::Stopping) else {
            return Ok(());
        };
        let status = self.stop_sequence().await?;
        if status.is_some() {
            let root = self.core.progress().begin(10);
            if let Err(e) = root
                .action("Deleting virtual machine", 10, |_| self.driver.delete())
                .await
            {
                self.core.set_state(BackendState::Error);
                return Err(e);
            }
        }
        self.core.set_state(BackendState::Stopped);
        Ok(())
    }
}
