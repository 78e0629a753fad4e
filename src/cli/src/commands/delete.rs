//! `nodevm delete` command.

use std::io::{BufRead, Write};

use clap::Args;

use crate::backend::Session;

#[derive(Args)]
pub struct DeleteArgs {
    /// Do not ask for confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: DeleteArgs) -> Result<(), Box<dyn std::error::Error>> {
    if !args.force && !confirm("Delete the VM and all of its data?")? {
        println!("Aborted");
        return Ok(());
    }

    let session = Session::open()?;
    let printer = session.watch();
    let result = session.backend.del().await;
    printer.abort();
    result?;

    println!("VM deleted");
    Ok(())
}

fn confirm(question: &str) -> Result<bool, std::io::Error> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
