//! `stratum run` command - launch a built image.
//!
//! Runtime secrets come from `--env-file` and `-e` and are layered over the
//! image env; they never enter a layer. The exit code of the service
//! becomes the exit code of the command.

use std::path::PathBuf;

use clap::Args;
use stratum_core::{EnvSet, RecipeConfig, StoreConfig, StratumError};
use stratum_runtime::{ImageReference, Launcher, OciImage};

#[derive(Args)]
pub struct RunArgs {
    /// Image to run (default: `image` from ./stratum.yaml)
    pub image: Option<String>,

    /// Read environment variables from a file, can be repeated
    #[arg(long = "env-file")]
    pub env_file: Vec<PathBuf>,

    /// Set an environment variable (KEY=VALUE), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image_ref = match &args.image {
        Some(image) => image.clone(),
        None => RecipeConfig::discover(&std::env::current_dir()?)?.image,
    };
    let reference = ImageReference::parse(&image_ref)?;
    let extra_env = runtime_env(&args)?;

    let store_config = StoreConfig::from_env()?;
    let store = super::open_image_store(&store_config)?;
    let full_ref = reference.full_reference();
    let stored = store
        .get(&full_ref)
        .await
        .ok_or_else(|| StratumError::ImageNotFound {
            reference: full_ref.clone(),
            message: "not built or pulled; run `stratum build` first".to_string(),
        })?;
    let image = OciImage::from_path(&stored.path)?;

    let launcher = Launcher::new(store_config.rootfs_dir());
    let status = launcher.launch(&image, &extra_env).await?;

    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

/// Env files in order, then `-e` assignments.
fn runtime_env(args: &RunArgs) -> Result<EnvSet, Box<dyn std::error::Error>> {
    let mut env = EnvSet::new();
    for path in &args.env_file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read env file {}: {}", path.display(), e))?;
        env.merge(&EnvSet::parse_env_file(&content)?);
    }
    for assignment in &args.env {
        let (key, value) = EnvSet::parse_assignment(assignment)?;
        env.set(key, value);
    }
    Ok(env)
}
