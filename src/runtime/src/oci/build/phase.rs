//! Build pipeline phases.
//!
//! A build moves through a fixed sequence of phases. Each instruction is
//! classified into the phase it establishes; the engine records the
//! furthest phase reached after every step.

use std::fmt;
use std::path::Path;

use glob::Pattern;
use serde::Serialize;

use super::dockerfile::Instruction;

/// Pipeline phase, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildPhase {
    Pending,
    BaseSelected,
    WorkdirSet,
    EnvSet,
    DepsInstalled,
    SourceCopied,
    ImageReady,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Pending => "pending",
            BuildPhase::BaseSelected => "base-selected",
            BuildPhase::WorkdirSet => "workdir-set",
            BuildPhase::EnvSet => "env-set",
            BuildPhase::DepsInstalled => "deps-installed",
            BuildPhase::SourceCopied => "source-copied",
            BuildPhase::ImageReady => "image-ready",
        }
    }

    /// Phase established by `instruction`, or `None` when it belongs to the
    /// phase already in progress (ARG, LABEL, CMD, the manifest COPY, ...).
    pub fn classify(instruction: &Instruction, manifest: Option<&Path>) -> Option<BuildPhase> {
        match instruction {
            Instruction::From { .. } => Some(BuildPhase::BaseSelected),
            Instruction::Workdir { .. } => Some(BuildPhase::WorkdirSet),
            Instruction::Env { .. } => Some(BuildPhase::EnvSet),
            Instruction::Run { command } => manifest
                .filter(|m| installs_manifest(command, m))
                .map(|_| BuildPhase::DepsInstalled),
            Instruction::Copy { src, .. } if copies_source(src, manifest) => {
                Some(BuildPhase::SourceCopied)
            }
            _ => None,
        }
    }

    /// Phase after `instruction`: phases only move forward.
    pub fn advance(self, instruction: &Instruction, manifest: Option<&Path>) -> BuildPhase {
        match Self::classify(instruction, manifest) {
            Some(next) if next > self => next,
            _ => self,
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a COPY brings in more of the context than the manifest alone:
/// the whole context, a directory holding the manifest, or a glob matching
/// it. Without a manifest only whole-context copies count.
pub fn copies_source(src: &[String], manifest: Option<&Path>) -> bool {
    src.iter().any(|s| {
        let s = s.trim_start_matches("./").trim_end_matches('/');
        if matches!(s, "." | "") {
            return true;
        }
        let Some(manifest) = manifest else {
            return false;
        };
        let path = Path::new(s);
        if path == manifest {
            return false;
        }
        if s.contains(['*', '?', '[']) {
            return Pattern::new(s).map_or(false, |p| p.matches_path(manifest));
        }
        manifest.starts_with(path)
    })
}

/// Whether a RUN command installs from the dependency manifest: one of its
/// words is the manifest path, or a path ending in the manifest file name.
pub fn installs_manifest(command: &str, manifest: &Path) -> bool {
    let manifest_str = manifest.to_string_lossy();
    let file_name = manifest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let words = shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(String::from).collect());

    words.iter().any(|word| {
        let word = word.as_str();
        let word = word.strip_prefix("./").unwrap_or(word);
        let word = word
            .strip_prefix("--requirement=")
            .or_else(|| word.strip_prefix("-r"))
            .filter(|w| !w.is_empty())
            .unwrap_or(word);
        word == manifest_str
            || (!file_name.is_empty()
                && (word == file_name || word.ends_with(&format!("/{}", file_name))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> &'static Path {
        Path::new("telegram_bot/requirements.txt")
    }

    fn run(cmd: &str) -> Instruction {
        Instruction::Run {
            command: cmd.to_string(),
        }
    }

    fn copy(src: &[&str], dst: &str) -> Instruction {
        Instruction::Copy {
            src: src.iter().map(|s| s.to_string()).collect(),
            dst: dst.to_string(),
        }
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(BuildPhase::Pending < BuildPhase::BaseSelected);
        assert!(BuildPhase::EnvSet < BuildPhase::DepsInstalled);
        assert!(BuildPhase::DepsInstalled < BuildPhase::SourceCopied);
        assert!(BuildPhase::SourceCopied < BuildPhase::ImageReady);
    }

    #[test]
    fn test_classify() {
        let m = Some(manifest());
        assert_eq!(
            BuildPhase::classify(
                &Instruction::From {
                    image: "python:3.11-slim".into()
                },
                m
            ),
            Some(BuildPhase::BaseSelected)
        );
        assert_eq!(
            BuildPhase::classify(&run("pip install --no-cache-dir -r telegram_bot/requirements.txt"), m),
            Some(BuildPhase::DepsInstalled)
        );
        assert_eq!(
            BuildPhase::classify(&copy(&["."], "."), m),
            Some(BuildPhase::SourceCopied)
        );
        assert_eq!(
            BuildPhase::classify(
                &copy(&["telegram_bot/requirements.txt"], "telegram_bot/requirements.txt"),
                m
            ),
            None
        );
        assert_eq!(BuildPhase::classify(&run("apt-get update"), m), None);
    }

    #[test]
    fn test_install_not_recognised_without_manifest() {
        assert_eq!(
            BuildPhase::classify(&run("pip install -r requirements.txt"), None),
            None
        );
    }

    #[test]
    fn test_advance_never_goes_back() {
        let m = Some(manifest());
        let phase = BuildPhase::SourceCopied.advance(
            &Instruction::Workdir {
                path: "/app".into(),
            },
            m,
        );
        assert_eq!(phase, BuildPhase::SourceCopied);

        let phase = BuildPhase::EnvSet.advance(&run("pip install -r telegram_bot/requirements.txt"), m);
        assert_eq!(phase, BuildPhase::DepsInstalled);
    }

    #[test]
    fn test_installs_manifest_variants() {
        let m = manifest();
        assert!(installs_manifest("pip install -r telegram_bot/requirements.txt", m));
        assert!(installs_manifest("pip install -rtelegram_bot/requirements.txt", m));
        assert!(installs_manifest(
            "pip install --requirement=./telegram_bot/requirements.txt",
            m
        ));
        assert!(installs_manifest("pip install -r /app/telegram_bot/requirements.txt", m));
        assert!(installs_manifest("cd telegram_bot && pip install -r requirements.txt", m));
        assert!(!installs_manifest("pip install aiogram", m));
        assert!(!installs_manifest("cat requirements.txt.bak", m));
    }

    #[test]
    fn test_copies_source() {
        let m = Some(manifest());
        let src = |s: &str| vec![s.to_string()];
        assert!(copies_source(&src("."), None));
        assert!(copies_source(&src("./"), m));
        assert!(copies_source(&src("telegram_bot"), m));
        assert!(copies_source(&src("./telegram_bot/"), m));
        assert!(copies_source(&src("telegram_bot/*"), m));
        assert!(copies_source(&src("*.txt"), m));
        assert!(!copies_source(&src("telegram_bot/requirements.txt"), m));
        assert!(!copies_source(&src("./telegram_bot/requirements.txt"), m));
        assert!(!copies_source(&src("setup.cfg"), m));
        assert!(!copies_source(&src("telegram_bot"), None));
    }

    #[test]
    fn test_package_directory_copy_is_source() {
        let m = Some(manifest());
        assert_eq!(
            BuildPhase::classify(&copy(&["telegram_bot/"], "telegram_bot/"), m),
            Some(BuildPhase::SourceCopied)
        );
        let phase = BuildPhase::EnvSet
            .advance(&copy(&["telegram_bot/"], "telegram_bot/"), m)
            .advance(&run("pip install -r telegram_bot/requirements.txt"), m);
        assert_eq!(phase, BuildPhase::SourceCopied);
    }

    #[test]
    fn test_display() {
        assert_eq!(BuildPhase::DepsInstalled.to_string(), "deps-installed");
        assert_eq!(BuildPhase::ImageReady.to_string(), "image-ready");
    }
}
