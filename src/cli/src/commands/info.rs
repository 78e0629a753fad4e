//! `nodevm info` command.

use clap::Args;

use nodevm_runtime::lima::migrate::find_bundled_image;
use nodevm_runtime::wsl::find_bundled_distro;
use nodevm_runtime::{HostPlatform, Paths};

use crate::backend::load_settings;

#[derive(Args)]
pub struct InfoArgs;

pub async fn execute(_args: InfoArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("nodevm version {}", nodevm_core::VERSION);

    let platform = HostPlatform::current();
    match platform {
        Some(p) => println!("Platform: {p:?}"),
        None => println!("Platform: unsupported"),
    }

    // Virtualization support
    match nodevm_runtime::check_virtualization_support().await {
        Ok(support) => {
            println!("Virtualization: {} ({})", support.backend, support.details);
        }
        Err(e) => {
            println!("Virtualization: not available ({e})");
        }
    }

    let paths = Paths::detect()?;
    println!("Home directory: {}", paths.home.display());
    println!("Resources: {}", paths.resources.display());

    // Bundled image
    let bundled = if platform == Some(HostPlatform::Windows) {
        find_bundled_distro(&paths.wsl_resources())
    } else {
        find_bundled_image(&paths.images_dir())
    };
    match bundled {
        Ok((path, version)) => println!("Bundled image: {} ({})", version, path.display()),
        Err(_) => println!("Bundled image: none"),
    }

    println!("Settings file: {}", paths.settings_file().display());
    match load_settings(&paths) {
        Ok(settings) => print!("{}", serde_yaml::to_string(&settings)?),
        Err(e) => println!("Settings: invalid ({e})"),
    }

    Ok(())
}
