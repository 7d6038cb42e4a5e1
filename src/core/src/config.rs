use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::env::EnvSet;
use crate::error::{Result, StratumError};

/// Name of the optional configuration file in the build context.
pub const CONFIG_FILE_NAME: &str = "stratum.yaml";

/// Environment variable overriding the stratum home directory.
pub const HOME_ENV_VAR: &str = "STRATUM_HOME";

/// How the service image is assembled from the build context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipeConfig {
    /// Tag given to the built image
    pub image: String,

    /// Base runtime image; must carry an explicit tag
    pub base_image: String,

    /// Working directory inside the image (absolute)
    pub workdir: String,

    /// Dependency manifest, relative to the build context
    pub manifest: PathBuf,

    /// Interpreter executable used by the entry point
    pub interpreter: String,

    /// Module run with `<interpreter> -m`
    pub module: String,

    /// Installer command; the manifest path is appended
    pub installer: String,

    /// Interpreter runtime flags
    pub flags: RuntimeFlags,

    /// Additional environment baked into the image after the flags
    pub env: BTreeMap<String, String>,

    /// Image labels
    pub labels: BTreeMap<String, String>,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            image: "telegram-bot:latest".to_string(),
            base_image: "python:3.11-slim".to_string(),
            workdir: "/app".to_string(),
            manifest: PathBuf::from("telegram_bot/requirements.txt"),
            interpreter: "python".to_string(),
            module: "telegram_bot.main".to_string(),
            installer: "pip install --no-cache-dir -r".to_string(),
            flags: RuntimeFlags::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl RecipeConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: RecipeConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded recipe configuration");
        Ok(config)
    }

    /// Load `stratum.yaml` from the build context, or fall back to defaults.
    pub fn discover(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.workdir.starts_with('/') {
            return Err(StratumError::ConfigError(format!(
                "workdir must be absolute: {}",
                self.workdir
            )));
        }

        if self.manifest.as_os_str().is_empty()
            || self.manifest.is_absolute()
            || self
                .manifest
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(StratumError::ConfigError(format!(
                "manifest must be a relative path inside the build context: {}",
                self.manifest.display()
            )));
        }

        let module_ok = !self.module.is_empty()
            && self.module.split('.').all(|part| {
                let mut chars = part.chars();
                matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !module_ok {
            return Err(StratumError::ConfigError(format!(
                "module must be a dotted identifier: {}",
                self.module
            )));
        }

        for (field, value) in [
            ("image", &self.image),
            ("base_image", &self.base_image),
            ("interpreter", &self.interpreter),
        ] {
            if value.is_empty() || value.contains(char::is_whitespace) {
                return Err(StratumError::ConfigError(format!(
                    "{} must be a non-empty word: '{}'",
                    field, value
                )));
            }
        }

        if self.installer.trim().is_empty() {
            return Err(StratumError::ConfigError(
                "installer must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Entry point argv: `<interpreter> -m <module>`.
    pub fn entrypoint(&self) -> Vec<String> {
        vec![
            self.interpreter.clone(),
            "-m".to_string(),
            self.module.clone(),
        ]
    }

    /// Manifest path with forward slashes, as written in the build description.
    pub fn manifest_str(&self) -> String {
        self.manifest
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Environment baked into the image: runtime flags first, then extras.
    pub fn image_env(&self) -> EnvSet {
        let mut env = self.flags.to_env(&self.workdir);
        for (k, v) in &self.env {
            env.set(k.clone(), v.clone());
        }
        env
    }
}

/// Interpreter flags exported into the image environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeFlags {
    /// PYTHONDONTWRITEBYTECODE=1
    pub no_bytecode: bool,

    /// PYTHONUNBUFFERED=1
    pub unbuffered: bool,

    /// PYTHONPATH; the working directory when unset
    pub module_path: Option<String>,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            no_bytecode: true,
            unbuffered: true,
            module_path: None,
        }
    }
}

impl RuntimeFlags {
    pub fn to_env(&self, workdir: &str) -> EnvSet {
        let mut env = EnvSet::new();
        if self.no_bytecode {
            env.set("PYTHONDONTWRITEBYTECODE", "1");
        }
        if self.unbuffered {
            env.set("PYTHONUNBUFFERED", "1");
        }
        env.set(
            "PYTHONPATH",
            self.module_path.clone().unwrap_or_else(|| workdir.to_string()),
        );
        env
    }
}

/// Locations of persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Root directory (default `~/.stratum`)
    pub home: PathBuf,

    /// Image store size cap in bytes
    pub max_image_bytes: u64,
}

/// Default image store cap: 10 GiB
const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

impl StoreConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    /// Resolve the home directory from `STRATUM_HOME`, falling back to `~/.stratum`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(Self::new(home));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            StratumError::ConfigError(format!(
                "Cannot determine home directory; set {}",
                HOME_ENV_VAR
            ))
        })?;
        Ok(Self::new(home.join(".stratum")))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    pub fn layer_cache_dir(&self) -> PathBuf {
        self.home.join("cache").join("layers")
    }

    /// Unpacked image root filesystems used by `run`.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.home.join("rootfs")
    }
}
