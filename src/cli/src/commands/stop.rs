//! `nodevm stop` command.

use clap::Args;

use crate::backend::Session;

#[derive(Args)]
pub struct StopArgs;

pub async fn execute(_args: StopArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open()?;
    let printer = session.watch();
    let result = session.backend.stop().await;
    printer.abort();
    result?;

    println!("VM stopped");
    Ok(())
}
