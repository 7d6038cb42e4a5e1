//! RUN step execution.
//!
//! The engine hands every RUN step to a [`CommandRunner`]. The production
//! runner chroots into the build rootfs; tests substitute their own.

use std::path::Path;
use std::process::Command;

use stratum_core::error::{Result, StratumError};
use stratum_core::EnvSet;

/// PATH given to RUN steps when the image env does not define one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything a runner needs to execute one RUN step.
#[derive(Debug, Clone, Copy)]
pub struct RunInvocation<'a> {
    /// 1-based step number, for error reporting
    pub step: usize,
    /// Root filesystem the command runs in
    pub rootfs: &'a Path,
    /// Shell command line
    pub command: &'a str,
    /// Working directory inside the rootfs
    pub workdir: &'a str,
    /// Build environment
    pub env: &'a EnvSet,
    /// Echo the command's stdout
    pub verbose: bool,
}

/// Executes RUN steps.
pub trait CommandRunner: Send + Sync {
    /// Run one step. A non-zero exit must be reported as
    /// [`StratumError::StepFailed`].
    fn run(&self, invocation: &RunInvocation<'_>) -> Result<()>;
}

/// Runs steps with `chroot <rootfs> /bin/sh -c`, a cleared environment
/// plus `PATH`, `HOME` and the build env.
#[derive(Debug, Default, Clone)]
pub struct ChrootRunner;

impl ChrootRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(invocation: &RunInvocation<'_>) -> Command {
        let script = format!(
            "cd {} && {}",
            shell_words::quote(invocation.workdir),
            invocation.command
        );

        let mut cmd = Command::new("chroot");
        cmd.arg(invocation.rootfs).arg("/bin/sh").arg("-c").arg(script);

        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for (key, value) in invocation.env.iter() {
            cmd.env(key, value);
        }
        cmd
    }
}

impl CommandRunner for ChrootRunner {
    fn run(&self, invocation: &RunInvocation<'_>) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(StratumError::BuildError(
                "RUN steps need a Linux host (chroot into the build rootfs)".to_string(),
            ));
        }

        tracing::debug!(
            step = invocation.step,
            command = invocation.command,
            workdir = invocation.workdir,
            "Executing RUN step"
        );

        let output = Self::command(invocation).output().map_err(|e| {
            StratumError::BuildError(format!("Failed to execute RUN command: {}", e))
        })?;

        if invocation.verbose {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.is_empty() {
                print!("{}", stdout);
            }
        }

        if !output.status.success() {
            return Err(StratumError::StepFailed {
                step: invocation.step,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
