//! `stratum cache` command - inspect and prune the layer cache.

use clap::{Args, Subcommand};
use stratum_core::StoreConfig;
use stratum_runtime::cache::LayerMeta;

use crate::output;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached stage layers
    Ls,
    /// Remove least recently used layers until the cache fits
    Prune {
        /// Size to shrink the cache to, e.g. "500m", "2g"; 0 empties it
        #[arg(long, default_value = "0")]
        max_size: String,
    },
}

pub async fn execute(args: CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cache = super::open_layer_cache(&StoreConfig::from_env()?)?;

    match args.command {
        CacheCommand::Ls => {
            let mut entries = cache.list_entries()?;
            entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

            let mut table = output::new_table(&["KEY", "SIZE", "LAST USED", "CREATED BY"]);
            for meta in &entries {
                table.add_row(row(meta));
            }
            println!("{table}");
            println!(
                "{} layer(s), {}",
                entries.len(),
                output::format_bytes(cache.total_size()?)
            );
        }
        CacheCommand::Prune { max_size } => {
            let max_bytes = output::parse_size_bytes(&max_size)?;
            let removed = cache.prune(max_bytes)?;
            println!(
                "Removed {} layer(s), {} remaining",
                removed,
                output::format_bytes(cache.total_size()?)
            );
        }
    }
    Ok(())
}

fn row(meta: &LayerMeta) -> Vec<String> {
    let last_used = chrono::DateTime::from_timestamp_millis(meta.last_accessed)
        .map(|dt| output::format_ago(&dt))
        .unwrap_or_else(|| "-".to_string());
    vec![
        meta.key.get(..12).unwrap_or(&meta.key).to_string(),
        output::format_bytes(meta.size_bytes),
        last_used,
        meta.created_by.clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_truncates_key() {
        let now = chrono::Utc::now().timestamp_millis();
        let meta = LayerMeta {
            key: "a".repeat(64),
            digest: "b".repeat(64),
            diff_id: "c".repeat(64),
            size_bytes: 1024,
            created_by: "COPY . .".to_string(),
            cached_at: now,
            last_accessed: now,
        };
        let row = row(&meta);
        assert_eq!(row[0], "a".repeat(12));
        assert_eq!(row[1], "1.0 KB");
        assert_eq!(row[3], "COPY . .");
    }
}
