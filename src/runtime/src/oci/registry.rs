//! OCI registry client for pulling base images.
//!
//! Uses `oci-distribution` to fetch a manifest, its config and layers from
//! a container registry (Docker Hub by default) and writes them out as an
//! OCI image layout.

use std::path::Path;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use stratum_core::error::{Result, StratumError};
use tokio::io::AsyncWriteExt;

use super::build::layer::sha256_file;
use super::reference::ImageReference;

/// Registry credentials.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls images from container registries.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl Default for RegistryPuller {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryPuller {
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Pull `reference` into an OCI layout at `target_dir`. Returns the
    /// manifest digest.
    ///
    /// A manifest that cannot be resolved is reported as
    /// [`StratumError::ImageNotFound`]; blob transfer failures as
    /// [`StratumError::RegistryError`].
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let registry = reference.registry.as_str();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| registry_error(registry, "create blobs directory", e))?;

        let auth = self.auth.to_oci_auth();
        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| StratumError::ImageNotFound {
                reference: reference.full_reference(),
                message: e.to_string(),
            })?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        std::fs::write(blobs_dir.join(hex_part(&manifest_digest)), &manifest_json)
            .map_err(|e| registry_error(registry, "write manifest", e))?;

        self.pull_blob(&oci_ref, &manifest.config, &blobs_dir, registry)
            .await?;
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            self.pull_blob(&oci_ref, layer, &blobs_dir, registry).await?;
        }

        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .map_err(|e| registry_error(registry, "write oci-layout", e))?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        std::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )
        .map_err(|e| registry_error(registry, "write index.json", e))?;

        tracing::info!(reference = %reference, digest = %manifest_digest, "Image pulled");
        Ok(manifest_digest)
    }

    /// Stream one blob to disk and check its digest.
    async fn pull_blob(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        registry: &str,
    ) -> Result<()> {
        let expected = hex_part(&descriptor.digest);
        let path = blobs_dir.join(expected);

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| registry_error(registry, "create blob file", e))?;
        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| StratumError::RegistryError {
                registry: registry.to_string(),
                message: format!("Failed to pull blob {}: {}", descriptor.digest, e),
            })?;
        file.flush()
            .await
            .map_err(|e| registry_error(registry, "flush blob", e))?;

        let actual = sha256_file(&path)?;
        if actual != expected {
            let _ = std::fs::remove_file(&path);
            return Err(StratumError::RegistryError {
                registry: registry.to_string(),
                message: format!(
                    "Digest mismatch for blob {}: got sha256:{}",
                    descriptor.digest, actual
                ),
            });
        }
        Ok(())
    }
}

fn registry_error(registry: &str, what: &str, e: impl std::fmt::Display) -> StratumError {
    StratumError::RegistryError {
        registry: registry.to_string(),
        message: format!("Failed to {}: {}", what, e),
    }
}

fn hex_part(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        StratumError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Selects the linux image for the host CPU from a multi-platform index.
/// Build steps run in a Linux rootfs whatever the host OS.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
