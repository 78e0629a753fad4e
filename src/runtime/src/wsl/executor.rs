use crate::executor::{ExecOptions, GuestExecutor};
use crate::paths::INSTANCE_NAME;
use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::Result;
use std::path::{Path, PathBuf};
use tokio::process::Child;

/// Guest access through `wsl.exe --exec`.
pub struct WslExecutor {
    runner: CommandRunner,
    wsl: PathBuf,
}

impl WslExecutor {
    pub fn new(runner: CommandRunner) -> Self {
        Self::with_program(runner, PathBuf::from("wsl.exe"))
    }

    pub fn with_program(runner: CommandRunner, wsl: PathBuf) -> Self {
        Self { runner, wsl }
    }

    fn exec_args<'a>(opts: ExecOptions, argv: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["-d", INSTANCE_NAME];
        if opts.root {
            args.extend_from_slice(&["--user", "root"]);
        }
        args.push("--exec");
        args.extend_from_slice(argv);
        args
    }

    /// Host path as seen from inside the distro.
    async fn guest_view(&self, host: &Path) -> Result<String> {
        let host = host.to_string_lossy();
        let out = self
            .exec_command(ExecOptions::capture(), &["wslpath", "-a", "-u", &host])
            .await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl GuestExecutor for WslExecutor {
    async fn exec_command(&self, opts: ExecOptions, argv: &[&str]) -> Result<String> {
        let args = Self::exec_args(opts, argv);
        let out = self.runner.run(&self.wsl, &args, opts.expect_failure).await?;
        Ok(if opts.capture { out.stdout } else { String::new() })
    }

    async fn spawn(&self, opts: ExecOptions, argv: &[&str]) -> Result<Child> {
        let args = Self::exec_args(opts, argv);
        self.runner.spawn(&self.wsl, &args)
    }

    async fn copy_file_in(&self, opts: ExecOptions, host: &Path, guest: &str) -> Result<()> {
        let source = self.guest_view(host).await?;
        self.exec_command(opts, &["cp", &source, guest]).await.map(|_| ())
    }

    async fn copy_file_out(&self, opts: ExecOptions, guest: &str, host: &Path) -> Result<()> {
        let target = self.guest_view(host).await?;
        self.exec_command(opts, &["cp", guest, &target]).await.map(|_| ())
    }
}
