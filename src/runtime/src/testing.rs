//! In-memory fakes for the backend seams.

use crate::executor::{ExecOptions, GuestExecutor};
use crate::host_check::{HostCapabilities, VirtualizationSupport};
use crate::lima::driver::{InstanceStatus, LimaDriver};
use crate::lima::migrate::ImageVersion;
use crate::privilege::{ElevationOutcome, Elevator, PrivilegeProbe, SudoCommand};
use crate::readiness::StatusProbe;
use crate::wsl::driver::WslDriver;
use async_trait::async_trait;
use nodevm_core::config::NodeSettings;
use nodevm_core::error::{Result, VmError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::Child;

fn command_error(command: &str) -> VmError {
    VmError::Command {
        command: command.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

/// Executable shell script standing in for `limactl` or `wsl.exe`.
///
/// Each invocation appends its arguments to `<dir>/<name>.log`, then runs
/// `body`.
#[cfg(unix)]
pub fn recording_stub(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let program = dir.join(name);
    let log = dir.join(format!("{}.log", name));
    let script = format!("#!/bin/sh\necho \"$*\" >> '{}'\n{}\n", log.display(), body);
    std::fs::write(&program, script).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
    program
}

/// Argument lines recorded by [`recording_stub`].
#[cfg(unix)]
pub fn stub_calls(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(format!("{}.log", name)))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Guest with an in-memory filesystem that records every command.
#[derive(Default)]
pub struct FakeExecutor {
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    fail_always: Mutex<Vec<String>>,
    fail_counts: Mutex<HashMap<String, usize>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command starting with `prefix` fails.
    pub fn fail_on(&self, prefix: &str) {
        self.fail_always.lock().push(prefix.to_string());
    }

    /// The next `times` commands starting with `prefix` fail.
    pub fn fail_times(&self, prefix: &str, times: usize) {
        self.fail_counts.lock().insert(prefix.to_string(), times);
    }

    pub fn put_file(&self, path: &str, contents: &str) {
        self.files
            .lock()
            .insert(path.to_string(), contents.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub fn staged_files(&self) -> Vec<String> {
        self.files
            .lock()
            .keys()
            .filter(|k| k.starts_with("/tmp/nodevm-"))
            .cloned()
            .collect()
    }

    /// Commands as `[root] argv...` or `argv...`.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn should_fail(&self, line: &str) -> bool {
        if self.fail_always.lock().iter().any(|p| line.starts_with(p)) {
            return true;
        }
        let mut counts = self.fail_counts.lock();
        for (prefix, remaining) in counts.iter_mut() {
            if line.starts_with(prefix.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl GuestExecutor for FakeExecutor {
    async fn exec_command(&self, opts: ExecOptions, argv: &[&str]) -> Result<String> {
        let line = argv.join(" ");
        let recorded = if opts.root {
            format!("[root] {}", line)
        } else {
            line.clone()
        };
        self.commands.lock().push(recorded);

        if self.should_fail(&line) {
            return Err(command_error(&line));
        }

        let mut files = self.files.lock();
        match argv {
            ["cat", path] => files.get(*path).cloned().ok_or_else(|| command_error(&line)),
            ["test", "-f", path] => files
                .contains_key(*path)
                .then(String::new)
                .ok_or_else(|| command_error(&line)),
            ["mv", "-f", from, to] => {
                let data = files.remove(*from).ok_or_else(|| command_error(&line))?;
                files.insert(to.to_string(), data);
                Ok(String::new())
            }
            ["rm", "-f", path] => {
                files.remove(*path);
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    async fn spawn(&self, opts: ExecOptions, argv: &[&str]) -> Result<Child> {
        let line = format!("spawn {}", argv.join(" "));
        self.commands.lock().push(if opts.root {
            format!("[root] {}", line)
        } else {
            line
        });
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .map_err(VmError::from)
    }

    async fn copy_file_in(&self, _opts: ExecOptions, host: &Path, guest: &str) -> Result<()> {
        let data = tokio::fs::read_to_string(host).await?;
        self.put_file(guest, &data);
        Ok(())
    }

    async fn copy_file_out(&self, _opts: ExecOptions, guest: &str, host: &Path) -> Result<()> {
        let data = self.file(guest).ok_or_else(|| command_error(guest))?;
        tokio::fs::write(host, data).await?;
        Ok(())
    }
}

/// Scripted node health endpoint.
pub struct FakeStatusProbe {
    online_after: Option<usize>,
    calls: AtomicUsize,
}

impl FakeStatusProbe {
    /// Reports online on the `n`th call and after.
    pub fn online_after(n: usize) -> Self {
        Self {
            online_after: Some(n),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always errors.
    pub fn failing() -> Self {
        Self {
            online_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for FakeStatusProbe {
    async fn online(&self, _node: &NodeSettings) -> Result<bool> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.online_after {
            Some(after) => Ok(n >= after),
            None => Err(VmError::HttpError("connection refused".to_string())),
        }
    }
}

/// Host whose checks pass or fail as configured.
pub struct FakeHost {
    architecture_ok: bool,
    virtualization_ok: bool,
    check_delay: Duration,
    pub architecture_checked: AtomicBool,
}

impl FakeHost {
    pub fn ok() -> Self {
        Self {
            architecture_ok: true,
            virtualization_ok: true,
            check_delay: Duration::ZERO,
            architecture_checked: AtomicBool::new(false),
        }
    }

    pub fn without_virtualization() -> Self {
        Self {
            architecture_ok: true,
            virtualization_ok: false,
            check_delay: Duration::ZERO,
            architecture_checked: AtomicBool::new(false),
        }
    }

    /// The architecture check takes `delay` to answer.
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    pub fn foreign_architecture() -> Self {
        Self {
            architecture_ok: false,
            virtualization_ok: true,
            check_delay: Duration::ZERO,
            architecture_checked: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl HostCapabilities for FakeHost {
    async fn check_architecture(&self) -> Result<()> {
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        self.architecture_checked.store(true, Ordering::SeqCst);
        if self.architecture_ok {
            Ok(())
        } else {
            Err(VmError::fatal("architecture mismatch"))
        }
    }

    async fn check_virtualization(&self) -> Result<VirtualizationSupport> {
        if self.virtualization_ok {
            Ok(VirtualizationSupport {
                backend: "fake".to_string(),
                details: "always available".to_string(),
            })
        } else {
            Err(VmError::fatal_with_hint(
                "virtualization unsupported",
                "enable virtualization",
            ))
        }
    }
}

/// Elevator that records scripts instead of running them.
pub struct FakeElevator {
    passwordless: bool,
    outcome: ElevationOutcome,
    probes: AtomicUsize,
    noninteractive: Mutex<Vec<String>>,
    interactive: Mutex<Vec<String>>,
}

impl FakeElevator {
    pub fn interactive(outcome: ElevationOutcome) -> Self {
        Self {
            passwordless: false,
            outcome,
            probes: AtomicUsize::new(0),
            noninteractive: Mutex::new(Vec::new()),
            interactive: Mutex::new(Vec::new()),
        }
    }

    pub fn passwordless() -> Self {
        Self {
            passwordless: true,
            ..Self::interactive(ElevationOutcome::Completed)
        }
    }

    pub fn noninteractive_scripts(&self) -> Vec<String> {
        self.noninteractive.lock().clone()
    }

    pub fn interactive_scripts(&self) -> Vec<String> {
        self.interactive.lock().clone()
    }

    /// Every call except `is_root`.
    pub fn total_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
            + self.noninteractive.lock().len()
            + self.interactive.lock().len()
    }
}

#[async_trait]
impl Elevator for FakeElevator {
    fn is_root(&self) -> bool {
        false
    }

    async fn can_elevate_noninteractive(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.passwordless
    }

    async fn run_noninteractive(&self, script: &str) -> Result<()> {
        self.noninteractive.lock().push(script.to_string());
        Ok(())
    }

    async fn run_interactive(&self, script: &str, _reason: &str) -> Result<ElevationOutcome> {
        self.interactive.lock().push(script.to_string());
        Ok(self.outcome)
    }
}

/// Probe with a fixed answer.
pub struct FakeProbe {
    command: Option<String>,
}

impl FakeProbe {
    pub fn satisfied() -> Self {
        Self { command: None }
    }

    pub fn needs(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
        }
    }
}

#[async_trait]
impl PrivilegeProbe for FakeProbe {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check(&self) -> Result<Option<SudoCommand>> {
        Ok(self.command.as_ref().map(|c| SudoCommand {
            reason: "test".to_string(),
            commands: vec![c.clone()],
            paths: vec![],
        }))
    }
}

/// Lima instance held in memory.
pub struct FakeLimaDriver {
    status: Mutex<Option<InstanceStatus>>,
    disk_format: Mutex<String>,
    start_delay: Duration,
    start_error: Mutex<Option<(String, bool)>>,
    fail_stop: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub convert_calls: AtomicUsize,
    pub network_daemons_stopped: Mutex<Vec<String>>,
}

impl FakeLimaDriver {
    pub fn new(status: Option<InstanceStatus>) -> Self {
        Self {
            status: Mutex::new(status),
            disk_format: Mutex::new("qcow2".to_string()),
            start_delay: Duration::ZERO,
            start_error: Mutex::new(None),
            fail_stop: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            convert_calls: AtomicUsize::new(0),
            network_daemons_stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// The next `start` fails with a backend error.
    pub fn fail_next_start(&self, message: &str, fatal: bool) {
        *self.start_error.lock() = Some((message.to_string(), fatal));
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    pub fn current_status(&self) -> Option<InstanceStatus> {
        *self.status.lock()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LimaDriver for FakeLimaDriver {
    async fn status(&self) -> Result<Option<InstanceStatus>> {
        Ok(*self.status.lock())
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if let Some((message, fatal)) = self.start_error.lock().take() {
            return Err(VmError::Backend {
                message,
                fatal,
                hint: None,
            });
        }
        *self.status.lock() = Some(InstanceStatus::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(command_error("limactl stop nodevm"));
        }
        *self.status.lock() = Some(InstanceStatus::Stopped);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = None;
        Ok(())
    }

    async fn disk_format(&self, _disk: &Path) -> Result<String> {
        Ok(self.disk_format.lock().clone())
    }

    async fn convert_to_raw(&self, _disk: &Path) -> Result<()> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        *self.disk_format.lock() = "raw".to_string();
        Ok(())
    }

    async fn stop_network_daemon(&self, pidfile: &str) -> Result<()> {
        self.network_daemons_stopped.lock().push(pidfile.to_string());
        Ok(())
    }
}

/// WSL with an in-memory distro list.
pub struct FakeWslDriver {
    available: bool,
    distros: Mutex<BTreeMap<String, Option<ImageVersion>>>,
    fail_terminate: AtomicBool,
    pub imports: Mutex<Vec<(String, String)>>,
    pub unregistered: Mutex<Vec<String>>,
    pub terminate_calls: AtomicUsize,
}

impl FakeWslDriver {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            distros: Mutex::new(BTreeMap::new()),
            fail_terminate: AtomicBool::new(false),
            imports: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
            terminate_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_distro(self, name: &str, version: Option<&str>) -> Self {
        self.distros.lock().insert(
            name.to_string(),
            version.and_then(ImageVersion::parse),
        );
        self
    }

    pub fn fail_terminate(&self) {
        self.fail_terminate.store(true, Ordering::SeqCst);
    }

    pub fn installed_distros(&self) -> Vec<String> {
        self.distros.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl WslDriver for FakeWslDriver {
    async fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(VmError::fatal_with_hint("WSL is not installed", "wsl --install"))
        }
    }

    async fn list_distros(&self) -> Result<Vec<String>> {
        if !self.available {
            return Err(command_error("wsl.exe --list --quiet"));
        }
        Ok(self.installed_distros())
    }

    async fn distro_version(&self, name: &str) -> Result<Option<ImageVersion>> {
        Ok(self.distros.lock().get(name).cloned().flatten())
    }

    async fn import(&self, name: &str, _install_dir: &Path, tarball: &Path) -> Result<()> {
        let file = tarball
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.imports.lock().push((name.to_string(), file.clone()));
        self.distros
            .lock()
            .insert(name.to_string(), ImageVersion::from_image_name(&file));
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        if self.distros.lock().remove(name).is_none() {
            return Err(command_error(&format!("wsl.exe --unregister {}", name)));
        }
        self.unregistered.lock().push(name.to_string());
        Ok(())
    }

    /// Like `wsl.exe`, terminating an unregistered distro is an error.
    async fn terminate(&self, name: &str) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) || !self.distros.lock().contains_key(name) {
            return Err(command_error(&format!("wsl.exe --terminate {}", name)));
        }
        Ok(())
    }
}
