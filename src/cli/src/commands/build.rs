//! `stratum build` command - build the service image.
//!
//! Uses the context's Dockerfile when there is one, otherwise the recipe
//! rendered from `stratum.yaml` (or defaults). Base images come from the
//! local store first, then the registry unless `--offline`.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Args;
use stratum_core::{RecipeConfig, StoreConfig};
use stratum_runtime::oci::{BaseImageSource, RegistryAuth};
use stratum_runtime::{BuildConfig, Builder, ChrootRunner, ImagePuller, StoreSource};

/// Reproducible-builds timestamp override.
const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Image name and tag (default: `image` from stratum.yaml)
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to a Dockerfile (default: <PATH>/Dockerfile, else the recipe)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Do not reuse cached layers
    #[arg(long)]
    pub no_cache: bool,

    /// Build even if lint reports errors
    #[arg(long)]
    pub allow_lint: bool,

    /// Resolve the base image from the local store only
    #[arg(long)]
    pub offline: bool,

    /// Suppress build output and print only the image digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = super::context_dir(&args.path)?;
    let recipe = RecipeConfig::discover(&context_dir)?;
    let (dockerfile, _) = super::load_dockerfile(&context_dir, args.file.as_deref(), &recipe)?;

    let store_config = StoreConfig::from_env()?;
    let store = Arc::new(super::open_image_store(&store_config)?);
    let cache = super::open_layer_cache(&store_config)?;
    let base: Arc<dyn BaseImageSource> = if args.offline {
        Arc::new(StoreSource::new(store.clone()))
    } else {
        Arc::new(ImagePuller::new(store.clone(), RegistryAuth::from_env()))
    };
    let builder = Builder::new(store, base, Arc::new(ChrootRunner::new()), cache);

    let mut config = BuildConfig::new(
        context_dir,
        dockerfile,
        args.tag.clone().unwrap_or_else(|| recipe.image.clone()),
    );
    config.build_args = parse_build_args(&args.build_arg)?;
    config.manifest = Some(recipe.manifest.clone());
    config.no_cache = args.no_cache;
    config.allow_lint = args.allow_lint;
    config.source_date_epoch = source_date_epoch()?;
    config.quiet = args.quiet;

    let result = builder.build(config).await?;

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!(
            "Cache: {} of {} steps reused, {} RUN step(s) executed",
            result.cache_hits(),
            result.steps.len(),
            result.runner_invocations
        );
    }

    Ok(())
}

/// Parse KEY=VALUE pairs.
fn parse_build_args(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg (expected KEY=VALUE): {arg}"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn source_date_epoch() -> Result<Option<i64>, String> {
    match std::env::var(SOURCE_DATE_EPOCH) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{SOURCE_DATE_EPOCH} must be an integer, got '{v}'")),
        _ => Ok(None),
    }
}
