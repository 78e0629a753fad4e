use crate::executor::{ExecOptions, GuestExecutor};
use crate::paths::INSTANCE_NAME;
use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::Result;
use std::path::{Path, PathBuf};
use tokio::process::Child;

/// Guest access through `limactl shell` and `limactl copy`.
pub struct LimaExecutor {
    runner: CommandRunner,
    limactl: PathBuf,
}

impl LimaExecutor {
    pub fn new(runner: CommandRunner, limactl: PathBuf) -> Self {
        Self { runner, limactl }
    }

    fn shell_args<'a>(opts: ExecOptions, argv: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["shell", "--workdir=/", INSTANCE_NAME];
        if opts.root {
            args.push("sudo");
        }
        args.extend_from_slice(argv);
        args
    }
}

#[async_trait]
impl GuestExecutor for LimaExecutor {
    async fn exec_command(&self, opts: ExecOptions, argv: &[&str]) -> Result<String> {
        let args = Self::shell_args(opts, argv);
        let out = self
            .runner
            .run(&self.limactl, &args, opts.expect_failure)
            .await?;
        Ok(if opts.capture { out.stdout } else { String::new() })
    }

    async fn spawn(&self, opts: ExecOptions, argv: &[&str]) -> Result<Child> {
        let args = Self::shell_args(opts, argv);
        self.runner.spawn(&self.limactl, &args)
    }

    async fn copy_file_in(&self, opts: ExecOptions, host: &Path, guest: &str) -> Result<()> {
        let target = format!("{}:{}", INSTANCE_NAME, guest);
        let host = host.to_string_lossy();
        self.runner
            .run(&self.limactl, &["copy", &host, &target], opts.expect_failure)
            .await
            .map(|_| ())
    }

    async fn copy_file_out(&self, opts: ExecOptions, guest: &str, host: &Path) -> Result<()> {
        let source = format!("{}:{}", INSTANCE_NAME, guest);
        let host = host.to_string_lossy();
        self.runner
            .run(&self.limactl, &["copy", &source, &host], opts.expect_failure)
            .await
            .map(|_| ())
    }
}
