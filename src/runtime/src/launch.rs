//! Launching a built image.
//!
//! The image's layers are unpacked into a rootfs directory once per image
//! digest; the process then runs under `chroot` with a cleared environment
//! holding exactly the image env plus any run-time overrides.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use stratum_core::error::{Result, StratumError};
use stratum_core::EnvSet;
use tokio::process::Command;

use crate::oci::layers::extract_layers;
use crate::oci::OciImage;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Marks a fully unpacked rootfs.
const READY_MARKER: &str = ".stratum-ready";

/// Changes into the directory given as `$0`, then execs the argv.
const CWD_WRAPPER: &str = "cd \"$0\" && exec \"$@\"";

/// Process to start for an image.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// `Entrypoint ++ Cmd`
    pub argv: Vec<String>,
    pub env: EnvSet,
    pub workdir: String,
}

impl LaunchSpec {
    /// Derive the process from the image config. `extra_env` is layered on
    /// top of the image env.
    pub fn from_image(image: &OciImage, extra_env: &EnvSet) -> Result<Self> {
        let argv: Vec<String> = image
            .entrypoint()
            .unwrap_or_default()
            .iter()
            .chain(image.cmd().unwrap_or_default())
            .cloned()
            .collect();
        if argv.is_empty() {
            return Err(StratumError::LaunchError(format!(
                "image {} declares neither ENTRYPOINT nor CMD",
                image.digest()
            )));
        }

        let mut env = image.env().clone();
        env.merge(extra_env);

        Ok(Self {
            argv,
            env,
            workdir: image.working_dir().unwrap_or("/").to_string(),
        })
    }

    /// `chroot` command running this spec inside `rootfs`.
    pub fn command(&self, rootfs: &Path) -> Command {
        let mut cmd = Command::new("chroot");
        cmd.arg(rootfs)
            .arg("/bin/sh")
            .arg("-c")
            .arg(CWD_WRAPPER)
            .arg(&self.workdir)
            .args(&self.argv);

        cmd.env_clear();
        if !self.env.contains("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        for (key, value) in self.env.iter() {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Unpacks images and runs them.
pub struct Launcher {
    rootfs_root: PathBuf,
}

impl Launcher {
    pub fn new(rootfs_root: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_root: rootfs_root.into(),
        }
    }

    /// Rootfs directory for `image`, unpacking it on first use.
    pub fn prepare_rootfs(&self, image: &OciImage) -> Result<PathBuf> {
        let hex = image.digest().strip_prefix("sha256:").unwrap_or(image.digest());
        let rootfs = self.rootfs_root.join(hex);
        if rootfs.join(READY_MARKER).exists() {
            tracing::debug!(rootfs = %rootfs.display(), "Reusing unpacked rootfs");
            return Ok(rootfs);
        }

        let staging = self.rootfs_root.join(format!("{}.partial", hex));
        for dir in [&staging, &rootfs] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        std::fs::create_dir_all(&staging)?;
        extract_layers(image.layer_paths(), &staging)?;
        std::fs::write(staging.join(READY_MARKER), image.digest())?;
        std::fs::rename(&staging, &rootfs)?;

        tracing::info!(digest = image.digest(), rootfs = %rootfs.display(), "Unpacked image");
        Ok(rootfs)
    }

    /// Run the image's entry point to completion and return its status.
    pub async fn launch(&self, image: &OciImage, extra_env: &EnvSet) -> Result<ExitStatus> {
        let spec = LaunchSpec::from_image(image, extra_env)?;
        if !cfg!(target_os = "linux") {
            return Err(StratumError::LaunchError(
                "launching needs a Linux host (chroot into the image rootfs)".to_string(),
            ));
        }
        let rootfs = self.prepare_rootfs(image)?;

        tracing::info!(argv = ?spec.argv, workdir = %spec.workdir, "Launching");
        let status = spec
            .command(&rootfs)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| StratumError::LaunchError(format!("Failed to start process: {}", e)))?;

        if !status.success() {
            tracing::warn!(code = ?status.code(), "Process exited with failure");
        }
        Ok(status)
    }
}
