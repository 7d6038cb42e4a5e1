//! Layer extraction.
//!
//! Applies gzip tarball layers onto a root filesystem directory, honouring
//! OCI whiteout markers so that files deleted in an upper layer disappear.

use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use stratum_core::error::{Result, StratumError};
use tar::Archive;

/// Prefix marking a deleted path in an upper layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding every lower-layer entry of its directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Apply a single layer (tar.gz) onto `target_dir`.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.is_file() {
        return Err(StratumError::OciImageError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir)?;

    let file = File::open(layer_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive.entries().map_err(|e| layer_error(layer_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| layer_error(layer_path, e))?;
        let path = entry
            .path()
            .map_err(|e| layer_error(layer_path, e))?
            .into_owned();

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                let dir = target_dir.join(safe_parent(&path));
                clear_dir(&dir)?;
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let victim = target_dir.join(safe_parent(&path)).join(hidden);
                remove_path(&victim)?;
                continue;
            }
        }

        // unpack_in refuses entries escaping the target directory
        entry
            .unpack_in(target_dir)
            .map_err(|e| layer_error(layer_path, e))?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}

/// Apply layers in order, lowest first.
pub fn extract_layers(layer_paths: &[PathBuf], target_dir: &Path) -> Result<()> {
    for layer in layer_paths {
        extract_layer(layer, target_dir)?;
    }
    Ok(())
}

fn layer_error(layer_path: &Path, e: std::io::Error) -> StratumError {
    StratumError::OciImageError(format!(
        "Failed to extract layer {}: {}",
        layer_path.display(),
        e
    ))
}

/// Parent of an archive path with root and `..` components dropped.
fn safe_parent(path: &Path) -> PathBuf {
    path.parent()
        .map(|p| {
            p.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect()
        })
        .unwrap_or_default()
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}
