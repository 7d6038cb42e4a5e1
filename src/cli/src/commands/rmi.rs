//! `stratum rmi` command.

use clap::Args;
use stratum_core::StoreConfig;
use stratum_runtime::ImageReference;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,
}

pub async fn execute(args: RmiArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(&StoreConfig::from_env()?)?;

    let mut failed = 0;
    for image in &args.images {
        let removed = match ImageReference::parse(image) {
            Ok(r) => store.remove(&r.full_reference()).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => println!("Untagged: {image}"),
            Err(e) => {
                eprintln!("Error: {image}: {e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("failed to remove {failed} image(s)").into());
    }
    Ok(())
}
