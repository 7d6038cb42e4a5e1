//! Image reference parsing.
//!
//! Turns strings like `python:3.11-slim` or
//! `ghcr.io/acme/python@sha256:...` into registry, repository, tag and
//! digest components.

use std::fmt;
use std::str::FromStr;

use stratum_core::error::{Result, StratumError};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when neither tag nor digest is given.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g. "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/python")
    pub repository: String,
    /// Tag as written, or `latest` when neither tag nor digest was given
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
    explicit_tag: bool,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `python` → docker.io/library/python:latest
    /// - `python:3.11-slim` → docker.io/library/python:3.11-slim
    /// - `localhost:5000/python` → localhost:5000/python:latest
    /// - `ghcr.io/acme/python@sha256:...` → pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StratumError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }
        if reference.contains(char::is_whitespace) {
            return Err(StratumError::OciImageError(format!(
                "Image reference contains whitespace: '{}'",
                reference
            )));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .map_or(false, |(algo, hex)| !algo.is_empty() && !hex.is_empty());
                if !valid {
                    return Err(StratumError::OciImageError(format!(
                        "Invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag can only follow the last path segment; a colon before the
        // last slash belongs to a registry port.
        let last_segment_start = name_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(pos) => {
                let colon = last_segment_start + pos;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(StratumError::OciImageError(format!(
                    "Empty tag in reference '{}'",
                    reference
                )));
            }
        }

        let (registry, repository) = split_registry_repository(name, reference)?;
        let explicit_tag = tag.is_some();
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
            explicit_tag,
        })
    }

    /// Whether the reference names a fixed image: a digest, or an explicit
    /// tag other than `latest`.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some() || (self.explicit_tag && self.tag.as_deref() != Some(DEFAULT_TAG))
    }

    /// Fully qualified form, used as the image store key.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

fn split_registry_repository(name: &str, reference: &str) -> Result<(String, String)> {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        // Official images live under library/ on Docker Hub
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    if repository.is_empty() || repository.split('/').any(str::is_empty) {
        return Err(StratumError::OciImageError(format!(
            "Invalid repository in reference '{}'",
            reference
        )));
    }
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(StratumError::OciImageError(format!(
            "Repository name must be lowercase: '{}'",
            reference
        )));
    }

    Ok((registry, repository))
}

impl FromStr for ImageReference {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference())
    }
}
