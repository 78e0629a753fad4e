//! CLI command definitions and dispatch.

mod delete;
mod info;
mod reset;
mod start;
mod status;
mod stop;
mod sudoers;

use clap::{Parser, Subcommand};

/// nodevm - container VM manager.
#[derive(Parser)]
#[command(name = "nodevm", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Start the VM, creating it on first use
    Start(start::StartArgs),
    /// Stop the VM
    Stop(stop::StopArgs),
    /// Stop, then start the VM with current settings
    Reset(start::StartArgs),
    /// Stop and unregister the VM, discarding its disks
    Delete(delete::DeleteArgs),
    /// Show the VM status
    Status(status::StatusArgs),
    /// Print the sudoers policy for the network helper
    Sudoers(sudoers::SudoersArgs),
    /// Show host and installation information
    Info(info::InfoArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Start(args) => start::execute(args).await,
        Command::Stop(args) => stop::execute(args).await,
        Command::Reset(args) => reset::execute(args).await,
        Command::Delete(args) => delete::execute(args).await,
        Command::Status(args) => status::execute(args).await,
        Command::Sudoers(args) => sudoers::execute(args).await,
        Command::Info(args) => info::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_flags() {
        let cli = Cli::try_parse_from([
            "nodevm", "start", "--cpus", "4", "--memory", "8", "--vm-type", "vz", "--no-admin",
        ])
        .unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.cpus, Some(4));
        assert_eq!(args.memory, Some(8));
        assert!(args.no_admin);
    }

    #[test]
    fn test_delete_requires_no_args() {
        assert!(Cli::try_parse_from(["nodevm", "delete", "--force"]).is_ok());
    }
}
