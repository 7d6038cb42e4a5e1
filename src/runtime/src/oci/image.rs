//! OCI image layout on disk.
//!
//! Reads an image layout (`oci-layout`, `index.json`, `blobs/sha256/...`)
//! into its manifest digest, runtime configuration and ordered layer blobs,
//! and writes layouts for images the builder produces.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use stratum_core::error::{Result, StratumError};
use stratum_core::EnvSet;

use super::build::layer::{sha256_bytes, LayerInfo};

const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// An OCI image loaded from disk.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,

    /// Manifest digest, `sha256:<hex>`
    digest: String,

    config: OciImageConfig,

    /// Layer blobs, bottom to top
    layer_paths: Vec<PathBuf>,

    /// Uncompressed layer digests, bottom to top
    diff_ids: Vec<String>,
}

/// Runtime configuration of an image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OciImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: EnvSet,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub architecture: String,
    pub os: String,
}

impl OciImage {
    /// Load an image layout from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        Self::validate_oci_layout(&root_dir)?;

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let digest = index
            .manifests()
            .first()
            .ok_or_else(|| StratumError::OciImageError("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest = read_json(&Self::blob_path(&root_dir, &digest), "manifest")?;

        let config_path = Self::blob_path(&root_dir, manifest.config().digest());
        let oci_config: ImageConfiguration = read_json(&config_path, "config")?;
        let diff_ids = oci_config.rootfs().diff_ids().clone();
        let config = OciImageConfig::from_oci_config(&oci_config);

        let layer_paths: Vec<PathBuf> = manifest
            .layers()
            .iter()
            .map(|layer| Self::blob_path(&root_dir, layer.digest()))
            .collect();
        if let Some(missing) = layer_paths.iter().find(|p| !p.is_file()) {
            return Err(StratumError::OciImageError(format!(
                "Layer blob missing: {}",
                missing.display()
            )));
        }

        Ok(Self {
            root_dir,
            digest,
            config,
            layer_paths,
            diff_ids,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    pub fn layer_paths(&self) -> &[PathBuf] {
        &self.layer_paths
    }

    pub fn diff_ids(&self) -> &[String] {
        &self.diff_ids
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.entrypoint.as_deref()
    }

    pub fn cmd(&self) -> Option<&[String]> {
        self.config.cmd.as_deref()
    }

    pub fn env(&self) -> &EnvSet {
        &self.config.env
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.config.working_dir.as_deref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(|s| s.as_str())
    }

    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(StratumError::OciImageError(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Path of a blob given its digest (`sha256:abc` or bare hex).
    pub(crate) fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        root_dir.join("blobs").join(algorithm).join(hash)
    }
}

impl OciImageConfig {
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let config = oci_config.config().as_ref();

        let env = config
            .and_then(|c| c.env().as_ref())
            .map(|list| EnvSet::from_oci_list(list.as_slice()))
            .unwrap_or_default();

        let labels = config
            .and_then(|c| c.labels().clone())
            .map(|l| l.into_iter().collect())
            .unwrap_or_default();

        Self {
            entrypoint: config.and_then(|c| c.entrypoint().clone()),
            cmd: config.and_then(|c| c.cmd().clone()),
            env,
            working_dir: config.and_then(|c| c.working_dir().clone()),
            labels,
            architecture: oci_config.architecture().to_string(),
            os: oci_config.os().to_string(),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StratumError::OciImageError(format!(
            "Failed to read {} at {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| StratumError::OciImageError(format!("Failed to parse {}: {}", what, e)))
}

/// Write an OCI image layout to `output_dir` from a config document and
/// layer tarballs. Returns the manifest digest.
///
/// Output bytes depend only on the inputs, so identical configs and layers
/// give identical digests.
pub fn write_layout(
    output_dir: &Path,
    config: &serde_json::Value,
    layers: &[LayerInfo],
) -> Result<String> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)?;

    let mut layer_descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        let blob = blobs_dir.join(&layer.digest);
        if !blob.exists() {
            std::fs::copy(&layer.path, &blob)?;
        }
        layer_descriptors.push(serde_json::json!({
            "mediaType": MEDIA_TYPE_LAYER,
            "digest": layer.prefixed_digest(),
            "size": layer.size,
        }));
    }

    let config_bytes = serde_json::to_vec(config)?;
    let config_digest = sha256_bytes(&config_bytes);
    std::fs::write(blobs_dir.join(&config_digest), &config_bytes)?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST,
        "config": {
            "mediaType": MEDIA_TYPE_CONFIG,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len(),
        },
        "layers": layer_descriptors,
    });
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    std::fs::write(blobs_dir.join(&manifest_digest), &manifest_bytes)?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_INDEX,
        "manifests": [{
            "mediaType": MEDIA_TYPE_MANIFEST,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len(),
        }],
    });
    std::fs::write(
        output_dir.join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )?;
    std::fs::write(
        output_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )?;

    Ok(format!("sha256:{}", manifest_digest))
}
