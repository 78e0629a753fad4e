//! `nodevm reset` command.

use crate::backend::{load_settings, Session};

use super::start::{run_start, StartArgs};

pub async fn execute(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open()?;
    let settings = args.apply(load_settings(&session.paths)?);
    settings.validate()?;

    let printer = session.watch();
    let result = run_start(&session, &settings, true).await;
    printer.abort();
    result
}
