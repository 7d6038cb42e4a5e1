//! `stratum images` command.

use clap::Args;
use stratum_core::StoreConfig;
use stratum_runtime::{ImageReference, StoredImage};

use crate::output;

const HEADERS: [&str; 6] = ["REPOSITORY", "TAG", "DIGEST", "ORIGIN", "SIZE", "STORED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = StoreConfig::from_env()?;
    if !store_config.images_dir().exists() {
        if !args.quiet {
            println!("{}", output::new_table(&HEADERS));
        }
        return Ok(());
    }

    let store = super::open_image_store(&store_config)?;
    let images = store.list().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for image in &images {
        table.add_row(row(image));
    }
    println!("{table}");
    Ok(())
}

fn row(image: &StoredImage) -> Vec<String> {
    let (repository, tag) = match ImageReference::parse(&image.reference) {
        Ok(r) => (
            format!("{}/{}", r.registry, r.repository),
            r.tag.unwrap_or_else(|| "<none>".to_string()),
        ),
        Err(_) => (image.reference.clone(), "<none>".to_string()),
    };
    vec![
        repository,
        tag,
        output::short_digest(&image.digest),
        image.origin.to_string(),
        output::format_bytes(image.size_bytes),
        output::format_ago(&image.stored_at),
    ]
}
