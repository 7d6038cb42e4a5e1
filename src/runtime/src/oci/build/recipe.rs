//! Canonical build recipe for the service image.
//!
//! Renders the stage list from a [`RecipeConfig`]: base image, working
//! directory, runtime env, manifest copy and install, source copy, entry
//! point. The output always passes the ordering lint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use stratum_core::error::{Result, StratumError};
use stratum_core::{EnvSet, RecipeConfig};

use super::dockerfile::Dockerfile;
use crate::oci::reference::ImageReference;

#[derive(Debug, Clone)]
pub struct Recipe {
    base: ImageReference,
    base_text: String,
    workdir: String,
    env: EnvSet,
    manifest: String,
    install: String,
    entrypoint: Vec<String>,
    labels: BTreeMap<String, String>,
}

impl Recipe {
    /// Validate `config` and build the recipe.
    pub fn from_config(config: &RecipeConfig) -> Result<Self> {
        config.validate()?;

        let base = ImageReference::parse(&config.base_image).map_err(|e| {
            StratumError::ConfigError(format!(
                "invalid base_image '{}': {}",
                config.base_image, e
            ))
        })?;
        if !base.is_pinned() {
            return Err(StratumError::ConfigError(format!(
                "base_image '{}' must name an explicit tag or digest",
                config.base_image
            )));
        }

        let manifest = config.manifest_str();
        Ok(Self {
            base,
            base_text: config.base_image.clone(),
            workdir: config.workdir.clone(),
            env: config.image_env(),
            install: format!(
                "{} {}",
                config.installer.trim(),
                shell_words::quote(&manifest)
            ),
            manifest,
            entrypoint: config.entrypoint(),
            labels: config.labels.clone(),
        })
    }

    pub fn base(&self) -> &ImageReference {
        &self.base
    }

    pub fn manifest(&self) -> PathBuf {
        PathBuf::from(&self.manifest)
    }

    pub fn install_command(&self) -> &str {
        &self.install
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    pub fn env(&self) -> &EnvSet {
        &self.env
    }

    /// Dockerfile text for the recipe.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Generated by stratum. Edit stratum.yaml instead.\n");
        let _ = writeln!(out, "FROM {}", self.base_text);

        if !self.labels.is_empty() {
            let pairs: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
                .collect();
            let _ = writeln!(out, "LABEL {}", pairs.join(" "));
        }

        let _ = writeln!(out, "WORKDIR {}", self.workdir);

        let pairs: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
            .collect();
        if !pairs.is_empty() {
            let _ = writeln!(out, "ENV {}", pairs.join(" \\\n    "));
        }

        let manifest = shell_words::quote(&self.manifest);
        let _ = writeln!(out, "COPY {} {}", manifest, manifest);
        let _ = writeln!(out, "RUN {}", self.install);
        out.push_str("COPY . .\n");

        let cmd: Vec<String> = self
            .entrypoint
            .iter()
            .map(|arg| serde_json::Value::String(arg.clone()).to_string())
            .collect();
        let _ = writeln!(out, "CMD [{}]", cmd.join(", "));
        out
    }

    /// Parsed form of [`Recipe::render`].
    pub fn dockerfile(&self) -> Result<Dockerfile> {
        Dockerfile::parse(&self.render())
    }
}
