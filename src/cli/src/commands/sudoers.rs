//! `nodevm sudoers` command.

use clap::Args;

use nodevm_runtime::lima::network::NetworkDescriptor;
use nodevm_runtime::Paths;

use crate::backend::load_settings;

#[derive(Args)]
pub struct SudoersArgs {
    /// Include a bridged network for this interface (repeatable)
    #[arg(long = "bridged")]
    pub bridged: Vec<String>,
}

pub async fn execute(args: SudoersArgs) -> Result<(), Box<dyn std::error::Error>> {
    let interfaces = if args.bridged.is_empty() {
        let paths = Paths::detect()?;
        load_settings(&paths)?.bridged_interface.into_iter().collect()
    } else {
        args.bridged
    };
    print!("{}", policy(&interfaces));
    Ok(())
}

fn policy(interfaces: &[String]) -> String {
    NetworkDescriptor::generate(interfaces).sudoers()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_covers_bridged_interface() {
        let text = policy(&["en0".to_string()]);
        assert!(text.contains("bridged_en0"));
        assert!(text.contains("shared"));
    }
}
