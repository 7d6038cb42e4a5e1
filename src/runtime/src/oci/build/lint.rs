//! Ordering lint for build descriptions.
//!
//! Checks the properties the service image relies on: dependencies are
//! installed from the manifest before the source tree is copied, exactly
//! one entry point is declared, the base image is pinned and the
//! interpreter runtime flags are set.
//!
//! | code    | rule                             | severity |
//! |---------|----------------------------------|----------|
//! | STR-001 | order.source_before_install      | error    |
//! | STR-002 | manifest.copied_before_install   | error    |
//! | STR-003 | entrypoint.exactly_one           | error    |
//! | STR-004 | base.pinned_tag                  | warning  |
//! | STR-005 | env.runtime_flags                | warning  |
//! | STR-006 | install.no_cache_dir             | warning  |

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::dockerfile::{Dockerfile, Instruction, Step};
use super::phase::{copies_source, installs_manifest};
use crate::oci::reference::ImageReference;

/// Flags every service image is expected to export.
const RUNTIME_FLAGS: &[(&str, Option<&str>)] = &[
    ("PYTHONDONTWRITEBYTECODE", Some("1")),
    ("PYTHONUNBUFFERED", Some("1")),
    ("PYTHONPATH", None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single lint finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub code: &'static str,
    pub rule: &'static str,
    pub severity: Severity,
    /// 1-based line of the offending instruction
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct LintOptions {
    /// Dependency manifest, relative to the build context. Ordering rules
    /// are skipped when unset.
    pub manifest: Option<PathBuf>,
}

fn violation(
    code: &'static str,
    rule: &'static str,
    severity: Severity,
    line: usize,
    message: impl Into<String>,
) -> Violation {
    Violation {
        code,
        rule,
        severity,
        line,
        message: message.into(),
    }
}

/// Lint a parsed build description. Findings are sorted by line.
pub fn lint(dockerfile: &Dockerfile, options: &LintOptions) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(manifest) = options.manifest.as_deref() {
        check_install_order(&dockerfile.steps, manifest, &mut violations);
    }
    check_entrypoint(&dockerfile.steps, &mut violations);
    check_base_pinned(&dockerfile.steps, &mut violations);
    check_runtime_flags(&dockerfile.steps, &mut violations);
    check_no_cache_dir(&dockerfile.steps, &mut violations);

    violations.sort_by_key(|v| (v.line, v.code));
    violations
}

/// Number of error-severity findings.
pub fn error_count(violations: &[Violation]) -> usize {
    violations
        .iter()
        .filter(|v| v.severity == Severity::Error)
        .count()
}

// --- Rules ---

fn check_install_order(steps: &[Step], manifest: &Path, out: &mut Vec<Violation>) {
    let install_idx = steps.iter().position(|s| match &s.instruction {
        Instruction::Run { command } => installs_manifest(command, manifest),
        _ => false,
    });
    let Some(install_idx) = install_idx else {
        return;
    };
    let install_line = steps[install_idx].line;
    let before = &steps[..install_idx];

    let mut source_copied_early = false;
    for step in before {
        if let Instruction::Copy { src, .. } = &step.instruction {
            if copies_source(src, Some(manifest)) {
                source_copied_early = true;
                out.push(violation(
                    "STR-001",
                    "order.source_before_install",
                    Severity::Error,
                    step.line,
                    format!(
                        "COPY {} brings in source before dependencies are installed (line {}); \
                         every source edit will re-run the install",
                        src.join(" "),
                        install_line
                    ),
                ));
            }
        }
    }

    let manifest_copied = before.iter().any(|s| match &s.instruction {
        Instruction::Copy { src, .. } => src.iter().any(|s| copies_manifest(s, manifest)),
        _ => false,
    });
    if !manifest_copied && !source_copied_early {
        out.push(violation(
            "STR-002",
            "manifest.copied_before_install",
            Severity::Error,
            install_line,
            format!(
                "dependency install runs before {} is copied into the image",
                manifest.display()
            ),
        ));
    }
}

/// Whether a COPY source brings in the manifest: the manifest itself or a
/// directory containing it.
fn copies_manifest(src: &str, manifest: &Path) -> bool {
    let src = Path::new(src.trim_start_matches("./").trim_end_matches('/'));
    manifest == src || (!src.as_os_str().is_empty() && manifest.starts_with(src))
}

fn check_entrypoint(steps: &[Step], out: &mut Vec<Violation>) {
    let cmds: Vec<&Step> = steps
        .iter()
        .filter(|s| matches!(s.instruction, Instruction::Cmd { .. }))
        .collect();
    let entrypoints: Vec<&Step> = steps
        .iter()
        .filter(|s| matches!(s.instruction, Instruction::Entrypoint { .. }))
        .collect();

    if cmds.is_empty() && entrypoints.is_empty() {
        let line = steps.last().map_or(1, |s| s.line);
        out.push(violation(
            "STR-003",
            "entrypoint.exactly_one",
            Severity::Error,
            line,
            "no CMD or ENTRYPOINT: the image has no process to run",
        ));
        return;
    }

    for extra in cmds.iter().skip(1).chain(entrypoints.iter().skip(1)) {
        out.push(violation(
            "STR-003",
            "entrypoint.exactly_one",
            Severity::Error,
            extra.line,
            format!(
                "{} declared more than once; only one entry point is allowed",
                extra.instruction.keyword()
            ),
        ));
    }
}

fn check_base_pinned(steps: &[Step], out: &mut Vec<Violation>) {
    for step in steps {
        let Instruction::From { image } = &step.instruction else {
            continue;
        };
        // Resolved from ARG at build time
        if image.contains('$') {
            continue;
        }
        let message = match ImageReference::parse(image) {
            Ok(r) if r.is_pinned() => continue,
            Ok(_) => format!(
                "base image '{}' is not pinned to a tag; builds will drift",
                image
            ),
            Err(e) => format!("base image '{}' cannot be parsed: {}", image, e),
        };
        out.push(violation(
            "STR-004",
            "base.pinned_tag",
            Severity::Warning,
            step.line,
            message,
        ));
    }
}

fn check_runtime_flags(steps: &[Step], out: &mut Vec<Violation>) {
    let mut declared: Vec<(&str, &str, usize)> = Vec::new();
    for step in steps {
        if let Instruction::Env { vars } = &step.instruction {
            for (k, v) in vars {
                declared.retain(|(key, _, _)| key != k);
                declared.push((k.as_str(), v.as_str(), step.line));
            }
        }
    }
    let from_line = steps
        .iter()
        .find(|s| matches!(s.instruction, Instruction::From { .. }))
        .map_or(1, |s| s.line);

    for (flag, expected) in RUNTIME_FLAGS {
        match declared.iter().find(|(k, _, _)| k == flag) {
            None => out.push(violation(
                "STR-005",
                "env.runtime_flags",
                Severity::Warning,
                from_line,
                format!("{} is not set", flag),
            )),
            Some((_, value, line)) => {
                if let Some(expected) = expected {
                    if value != expected {
                        out.push(violation(
                            "STR-005",
                            "env.runtime_flags",
                            Severity::Warning,
                            *line,
                            format!("{}={} (expected {})", flag, value, expected),
                        ));
                    }
                }
            }
        }
    }
}

fn check_no_cache_dir(steps: &[Step], out: &mut Vec<Violation>) {
    let mut pip_cache_disabled = false;
    for step in steps {
        match &step.instruction {
            Instruction::Env { vars } => {
                if let Some((_, v)) = vars.iter().find(|(k, _)| k == "PIP_NO_CACHE_DIR") {
                    pip_cache_disabled = !matches!(v.as_str(), "" | "0" | "false" | "off");
                }
            }
            Instruction::Run { command } => {
                let lowered = command.to_ascii_lowercase();
                let is_pip_install = ["pip install", "pip3 install", "-m pip install"]
                    .iter()
                    .any(|p| lowered.contains(p));
                if is_pip_install && !pip_cache_disabled && !lowered.contains("--no-cache-dir") {
                    out.push(violation(
                        "STR-006",
                        "install.no_cache_dir",
                        Severity::Warning,
                        step.line,
                        "pip install without --no-cache-dir leaves the download cache in the layer",
                    ));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = r#"FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app
COPY telegram_bot/requirements.txt telegram_bot/requirements.txt
RUN pip install --no-cache-dir -r telegram_bot/requirements.txt
COPY . .
CMD ["python", "-m", "telegram_bot.main"]
"#;

    fn options() -> LintOptions {
        LintOptions {
            manifest: Some(PathBuf::from("telegram_bot/requirements.txt")),
        }
    }

    fn run_lint(content: &str) -> Vec<Violation> {
        lint(&Dockerfile::parse(content).unwrap(), &options())
    }

    fn codes(violations: &[Violation]) -> Vec<&'static str> {
        violations.iter().map(|v| v.code).collect()
    }

    #[test]
    fn test_canonical_recipe_is_clean() {
        assert!(run_lint(CANONICAL).is_empty());
    }

    #[test]
    fn test_source_copied_before_install() {
        let content = r#"FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app
COPY . .
RUN pip install --no-cache-dir -r telegram_bot/requirements.txt
CMD ["python", "-m", "telegram_bot.main"]
"#;
        let violations = run_lint(content);
        assert_eq!(codes(&violations), vec!["STR-001"]);
        assert_eq!(violations[0].line, 4);
        assert_eq!(violations[0].severity, Severity::Error);
        assert_eq!(error_count(&violations), 1);
    }

    #[test]
    fn test_install_without_manifest_copy() {
        let content = r#"FROM python:3.11-slim
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app
RUN pip install --no-cache-dir -r telegram_bot/requirements.txt
COPY . .
CMD ["python", "-m", "telegram_bot.main"]
"#;
        let violations = run_lint(content);
        assert_eq!(codes(&violations), vec!["STR-002"]);
        assert_eq!(violations[0].line, 4);
    }

    #[test]
    fn test_package_directory_copied_before_install() {
        let content = CANONICAL.replace(
            "COPY telegram_bot/requirements.txt telegram_bot/requirements.txt",
            "COPY telegram_bot/ telegram_bot/",
        );
        let violations = run_lint(&content);
        assert_eq!(codes(&violations), vec!["STR-001"]);
        assert_eq!(violations[0].line, 4);
        assert!(violations[0].message.contains("telegram_bot/"));
    }

    #[test]
    fn test_glob_matching_manifest_copied_before_install() {
        let content = CANONICAL.replace(
            "COPY telegram_bot/requirements.txt telegram_bot/requirements.txt",
            "COPY telegram_bot/* telegram_bot/",
        );
        assert_eq!(codes(&run_lint(&content)), vec!["STR-001"]);
    }

    #[test]
    fn test_unrelated_file_before_install_is_fine() {
        let content = CANONICAL.replace(
            "COPY telegram_bot/requirements.txt telegram_bot/requirements.txt",
            "COPY telegram_bot/requirements.txt telegram_bot/requirements.txt\nCOPY setup.cfg setup.cfg",
        );
        assert!(run_lint(&content).is_empty());
    }

    #[test]
    fn test_entrypoint_missing_and_duplicated() {
        let missing = CANONICAL.replace("CMD [\"python\", \"-m\", \"telegram_bot.main\"]\n", "");
        assert_eq!(codes(&run_lint(&missing)), vec!["STR-003"]);

        let twice = format!("{}CMD [\"python\", \"-m\", \"other\"]\n", CANONICAL);
        let violations = run_lint(&twice);
        assert_eq!(codes(&violations), vec!["STR-003"]);
        assert_eq!(violations[0].line, 8);
    }

    #[test]
    fn test_entrypoint_plus_cmd_is_one_entry_point() {
        let content = CANONICAL.replace(
            "CMD [\"python\", \"-m\", \"telegram_bot.main\"]",
            "ENTRYPOINT [\"python\"]\nCMD [\"-m\", \"telegram_bot.main\"]",
        );
        assert!(run_lint(&content).is_empty());
    }

    #[test]
    fn test_unpinned_base() {
        let content = CANONICAL.replace("python:3.11-slim", "python");
        let violations = run_lint(&content);
        assert_eq!(codes(&violations), vec!["STR-004"]);
        assert_eq!(violations[0].severity, Severity::Warning);
        assert_eq!(error_count(&violations), 0);

        let latest = CANONICAL.replace("python:3.11-slim", "python:latest");
        assert_eq!(codes(&run_lint(&latest)), vec!["STR-004"]);
    }

    #[test]
    fn test_arg_base_is_not_checked() {
        let content = format!("ARG PY=3.11\n{}", CANONICAL.replace("python:3.11-slim", "python:${PY}-slim"));
        assert!(run_lint(&content).is_empty());
    }

    #[test]
    fn test_missing_and_wrong_runtime_flags() {
        let content = CANONICAL.replace(
            "ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app",
            "ENV PYTHONUNBUFFERED=0",
        );
        let violations = run_lint(&content);
        assert_eq!(codes(&violations), vec!["STR-005", "STR-005", "STR-005"]);
        assert!(violations.iter().any(|v| v.message.contains("PYTHONUNBUFFERED=0")));
        assert!(violations.iter().any(|v| v.message.contains("PYTHONPATH is not set")));
    }

    #[test]
    fn test_later_env_overrides_earlier() {
        let content = CANONICAL.replace(
            "ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app",
            "ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=0 PYTHONPATH=/app\nENV PYTHONUNBUFFERED=1",
        );
        assert!(run_lint(&content).is_empty());
    }

    #[test]
    fn test_pip_cache_warning() {
        let content = CANONICAL.replace(" --no-cache-dir", "");
        let violations = run_lint(&content);
        assert_eq!(codes(&violations), vec!["STR-006"]);
        assert_eq!(violations[0].line, 5);

        let with_env = content.replace(
            "WORKDIR /app",
            "WORKDIR /app\nENV PIP_NO_CACHE_DIR=1",
        );
        assert!(run_lint(&with_env).is_empty());
    }

    #[test]
    fn test_ordering_rules_need_manifest() {
        let content = r#"FROM python:3.11-slim
ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app
COPY . .
RUN pip install --no-cache-dir -r telegram_bot/requirements.txt
CMD ["python", "-m", "telegram_bot.main"]
"#;
        let df = Dockerfile::parse(content).unwrap();
        assert!(lint(&df, &LintOptions::default()).is_empty());
    }

    #[test]
    fn test_violations_sorted_by_line() {
        let content = r#"FROM python
COPY . .
RUN pip install -r telegram_bot/requirements.txt
"#;
        let violations = run_lint(content);
        let lines: Vec<usize> = violations.iter().map(|v| v.line).collect();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);
        assert!(codes(&violations).contains(&"STR-001"));
        assert!(codes(&violations).contains(&"STR-003"));
    }
}
