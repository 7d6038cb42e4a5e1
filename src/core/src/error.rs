use std::path::PathBuf;

use thiserror::Error;

/// Stratum error types
#[derive(Error, Debug)]
pub enum StratumError {
    /// Build description could not be parsed
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Base image tag or digest could not be resolved
    #[error("Image not found: {reference} ({message})")]
    ImageNotFound { reference: String, message: String },

    /// Registry transport or authentication failure
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Dependency manifest absent from the build context
    #[error("Dependency manifest not found in build context: {}", .path.display())]
    ManifestMissing { path: PathBuf },

    /// Dependency manifest present but unusable
    #[error("Dependency manifest {} is invalid: {message}", .path.display())]
    ManifestInvalid { path: PathBuf, message: String },

    /// COPY source missing or outside the build context
    #[error("COPY failed: {0}")]
    CopyFailed(String),

    /// A RUN step exited non-zero
    #[error("Step {step} failed with exit code {code}: {stderr}")]
    StepFailed {
        step: usize,
        code: i32,
        stderr: String,
    },

    /// Ordering lint reported errors
    #[error("Lint failed: {0} error(s) in build description")]
    LintFailed(usize),

    /// Generic build failure
    #[error("Build error: {0}")]
    BuildError(String),

    /// Layer cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Service process could not be started
    #[error("Launch error: {0}")]
    LaunchError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StratumError {
    fn from(err: serde_yaml::Error) -> Self {
        StratumError::SerializationError(err.to_string())
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let error = StratumError::Parse {
            line: 7,
            message: "unknown instruction: EXPOSE".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Parse error at line 7: unknown instruction: EXPOSE"
        );
    }

    #[test]
    fn test_image_not_found_display() {
        let error = StratumError::ImageNotFound {
            reference: "python:3.99-slim".to_string(),
            message: "manifest unknown".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Image not found: python:3.99-slim (manifest unknown)"
        );
    }

    #[test]
    fn test_manifest_missing_display() {
        let error = StratumError::ManifestMissing {
            path: PathBuf::from("telegram_bot/requirements.txt"),
        };
        assert_eq!(
            error.to_string(),
            "Dependency manifest not found in build context: telegram_bot/requirements.txt"
        );
    }

    #[test]
    fn test_manifest_invalid_display() {
        let error = StratumError::ManifestInvalid {
            path: PathBuf::from("telegram_bot/requirements.txt"),
            message: "not valid UTF-8".to_string(),
        };
        assert!(error.to_string().contains("not valid UTF-8"));
        assert!(error.to_string().contains("requirements.txt"));
    }

    #[test]
    fn test_step_failed_display() {
        let error = StratumError::StepFailed {
            step: 5,
            code: 1,
            stderr: "No matching distribution found for aiogram==9.9".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Step 5 failed with exit code 1: No matching distribution found for aiogram==9.9"
        );
    }

    #[test]
    fn test_lint_failed_display() {
        let error = StratumError::LintFailed(2);
        assert_eq!(
            error.to_string(),
            "Lint failed: 2 error(s) in build description"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = StratumError::RegistryError {
            registry: "registry-1.docker.io".to_string(),
            message: "401 Unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: registry-1.docker.io - 401 Unauthorized"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StratumError = io_error.into();
        assert!(matches!(error, StratumError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: StratumError = json_err.into();
        assert!(matches!(error, StratumError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<String>>("key: [unclosed").unwrap_err();
        let error: StratumError = yaml_err.into();
        assert!(matches!(error, StratumError::SerializationError(_)));
    }

    #[test]
    fn test_config_error_display() {
        let error = StratumError::ConfigError("workdir must be absolute".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: workdir must be absolute"
        );
    }
}
