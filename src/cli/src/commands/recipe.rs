//! `stratum recipe` command - print or write the canonical recipe.

use std::path::PathBuf;

use clap::Args;
use stratum_core::RecipeConfig;
use stratum_runtime::Recipe;

#[derive(Args)]
pub struct RecipeArgs {
    /// Build context directory (read for stratum.yaml)
    #[arg(default_value = ".")]
    pub path: String,

    /// Write to this file instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: RecipeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = super::context_dir(&args.path)?;
    let config = RecipeConfig::discover(&context_dir)?;
    let rendered = Recipe::from_config(&config)?.render();

    match args.output {
        Some(path) => {
            std::fs::write(&path, &rendered)
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            tracing::info!(path = %path.display(), "Wrote recipe");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
