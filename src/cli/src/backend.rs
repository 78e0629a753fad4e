//! Backend construction and event printing shared by the commands.

use nodevm_core::{BackendEvents, BackendSettings, VmError};
use nodevm_runtime::{create_backend, unsupported_platform, BackendDeps, HostPlatform, Paths, VmBackend};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::output::{format_notification, format_progress};

/// A backend for this host together with where it keeps its files.
pub struct Session {
    pub paths: Paths,
    pub platform: HostPlatform,
    pub backend: Box<dyn VmBackend>,
}

impl Session {
    pub fn open() -> Result<Self, VmError> {
        let platform = HostPlatform::current().ok_or_else(unsupported_platform)?;
        let paths = Paths::detect()?;
        let deps = BackendDeps::system(paths.clone(), BackendEvents::default());
        tracing::debug!(?platform, home = %paths.home.display(), "Opening backend");
        Ok(Self {
            backend: create_backend(platform, deps),
            paths,
            platform,
        })
    }

    /// Print progress and notifications until the session ends.
    pub fn watch(&self) -> JoinHandle<()> {
        spawn_printer(self.backend.core().events())
    }
}

/// Settings from the settings file, or the defaults when there is none.
pub fn load_settings(paths: &Paths) -> Result<BackendSettings, VmError> {
    BackendSettings::load(&paths.settings_file())
}

/// Print progress steps and notifications to stderr as they arrive.
///
/// Repeated progress events for the same step are collapsed into one line.
pub fn spawn_printer(events: &BackendEvents) -> JoinHandle<()> {
    let mut progress = events.subscribe_progress();
    let mut notifications = events.subscribe_notifications();

    tokio::spawn(async move {
        let mut last: Option<String> = None;
        loop {
            tokio::select! {
                event = progress.recv() => match event {
                    Ok(p) => {
                        if p.description != last {
                            eprintln!("{}", format_progress(&p));
                            last = p.description.clone();
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                event = notifications.recv() => match event {
                    Ok(n) => eprintln!("{}", format_notification(&n)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
