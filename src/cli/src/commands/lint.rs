//! `stratum lint` command - check stage ordering and runtime flags.

use clap::{Args, ValueEnum};
use stratum_core::RecipeConfig;
use stratum_runtime::oci::build::lint::{error_count, lint, LintOptions};

use super::Source;
use crate::output;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LintFormat {
    Table,
    Json,
}

#[derive(Args)]
pub struct LintArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Path to a Dockerfile (default: <PATH>/Dockerfile, else the recipe)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    pub format: LintFormat,
}

pub async fn execute(args: LintArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = super::context_dir(&args.path)?;
    let config = RecipeConfig::discover(&context_dir)?;
    let (dockerfile, source) = super::load_dockerfile(&context_dir, args.file.as_deref(), &config)?;

    let violations = lint(
        &dockerfile,
        &LintOptions {
            manifest: Some(config.manifest.clone()),
        },
    );

    match args.format {
        LintFormat::Json => println!("{}", serde_json::to_string_pretty(&violations)?),
        LintFormat::Table => {
            let name = match &source {
                Source::File(p) => p.display().to_string(),
                Source::Recipe => "<recipe>".to_string(),
            };
            if violations.is_empty() {
                println!("{name}: no findings");
            } else {
                let mut table = output::new_table(&["LINE", "CODE", "SEVERITY", "RULE", "MESSAGE"]);
                for v in &violations {
                    table.add_row(vec![
                        v.line.to_string(),
                        v.code.to_string(),
                        v.severity.to_string(),
                        v.rule.to_string(),
                        v.message.clone(),
                    ]);
                }
                println!("{name}");
                println!("{table}");
            }
        }
    }

    let errors = error_count(&violations);
    if errors > 0 {
        return Err(format!("{errors} lint error(s)").into());
    }
    Ok(())
}
