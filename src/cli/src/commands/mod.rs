//! CLI command definitions and dispatch.

mod build;
mod cache;
mod images;
mod lint;
mod pull;
mod recipe;
mod rmi;
mod run;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use stratum_core::{RecipeConfig, StoreConfig};
use stratum_runtime::cache::LayerCache;
use stratum_runtime::{Dockerfile, ImageStore, Recipe};

/// stratum - layered, cache-aware image builder for the Telegram bot service.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build the service image
    Build(build::BuildArgs),
    /// Check a build description for ordering mistakes
    Lint(lint::LintArgs),
    /// Print the canonical build recipe
    Recipe(recipe::RecipeArgs),
    /// Launch a built image
    Run(run::RunArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Pull a base image into the store
    Pull(pull::PullArgs),
    /// Remove one or more stored images
    Rmi(rmi::RmiArgs),
    /// Inspect or prune the layer cache
    Cache(cache::CacheArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Lint(args) => lint::execute(args).await,
        Command::Recipe(args) => recipe::execute(args).await,
        Command::Run(args) => run::execute(args).await,
        Command::Images(args) => images::execute(args).await,
        Command::Pull(args) => pull::execute(args).await,
        Command::Rmi(args) => rmi::execute(args).await,
        Command::Cache(args) => cache::execute(args).await,
    }
}

/// Open the shared image store.
pub(crate) fn open_image_store(config: &StoreConfig) -> Result<ImageStore, Box<dyn std::error::Error>> {
    let store = ImageStore::new(&config.images_dir(), config.max_image_bytes)?;
    Ok(store)
}

pub(crate) fn open_layer_cache(config: &StoreConfig) -> Result<LayerCache, Box<dyn std::error::Error>> {
    Ok(LayerCache::new(&config.layer_cache_dir())?)
}

/// Canonicalized build context directory.
pub(crate) fn context_dir(path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dir = PathBuf::from(path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", path, e))?;
    if !dir.is_dir() {
        return Err(format!("Build context '{}' is not a directory", dir.display()).into());
    }
    Ok(dir)
}

/// Where a build description came from.
pub(crate) enum Source {
    File(PathBuf),
    Recipe,
}

/// Build description for a context: `-f`, else `<context>/Dockerfile`,
/// else the recipe rendered from configuration.
pub(crate) fn load_dockerfile(
    context: &Path,
    file: Option<&str>,
    config: &RecipeConfig,
) -> Result<(Dockerfile, Source), Box<dyn std::error::Error>> {
    let path = match file {
        Some(f) => {
            let p = PathBuf::from(f);
            let p = if p.is_absolute() { p } else { context.join(p) };
            if !p.exists() {
                return Err(format!("Dockerfile not found at {}", p.display()).into());
            }
            Some(p)
        }
        None => Some(context.join("Dockerfile")).filter(|p| p.is_file()),
    };

    match path {
        Some(p) => Ok((Dockerfile::from_file(&p)?, Source::File(p))),
        None => Ok((Recipe::from_config(config)?.dockerfile()?, Source::Recipe)),
    }
}
