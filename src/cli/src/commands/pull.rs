//! `stratum pull` command - fetch a base image ahead of a build.

use std::sync::Arc;

use clap::Args;
use stratum_core::StoreConfig;
use stratum_runtime::oci::RegistryAuth;
use stratum_runtime::ImagePuller;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference, e.g. "python:3.11-slim"
    pub image: String,

    /// Pull even if the image is already stored
    #[arg(long)]
    pub force: bool,

    /// Suppress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(super::open_image_store(&StoreConfig::from_env()?)?);
    let puller = ImagePuller::new(store, RegistryAuth::from_env());

    if !args.quiet && !args.force && puller.is_cached(&args.image).await {
        println!("{}: already stored", args.image);
    }

    let image = if args.force {
        puller.force_pull(&args.image).await?
    } else {
        puller.pull(&args.image).await?
    };

    if args.quiet {
        println!("{}", image.digest());
    } else {
        println!("Digest: {}", image.digest());
    }
    Ok(())
}
