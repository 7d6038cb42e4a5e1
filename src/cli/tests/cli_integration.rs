//! Integration test: drive the `stratum` binary.
//!
//! Covers the commands that need neither a registry nor chroot: recipe
//! emission, lint, and the fail-fast paths of `build` and `run`. Every
//! test points `STRATUM_HOME` at a temporary directory.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn stratum(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stratum"))
        .args(args)
        .env("STRATUM_HOME", home)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run `stratum {}`: {}", args.join(" "), e))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn service_context() -> TempDir {
    let dir = TempDir::new().unwrap();
    let pkg = dir.path().join("telegram_bot");
    std::fs::create_dir_all(&pkg).unwrap();
    std::fs::write(pkg.join("requirements.txt"), "aiogram==3.4.1\n").unwrap();
    std::fs::write(pkg.join("main.py"), "print('polling')\n").unwrap();
    dir
}

#[test]
fn test_recipe_prints_canonical_stages() {
    let home = TempDir::new().unwrap();
    let ctx = service_context();

    let out = stratum(home.path(), &["recipe", ctx.path().to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let text = stdout(&out);
    let stages: Vec<&str> = text
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with(' '))
        .collect();
    assert_eq!(stages[0], "FROM python:3.11-slim");
    assert_eq!(stages[1], "WORKDIR /app");
    assert!(stages[2].starts_with("ENV "));
    assert_eq!(
        stages[3],
        "COPY telegram_bot/requirements.txt telegram_bot/requirements.txt"
    );
    assert_eq!(
        stages[4],
        "RUN pip install --no-cache-dir -r telegram_bot/requirements.txt"
    );
    assert_eq!(stages[5], "COPY . .");
    assert_eq!(stages[6], r#"CMD ["python", "-m", "telegram_bot.main"]"#);
}

#[test]
fn test_recipe_honours_config_file() {
    let home = TempDir::new().unwrap();
    let ctx = service_context();
    std::fs::write(
        ctx.path().join("stratum.yaml"),
        "base_image: python:3.12-slim\nmodule: telegram_bot.app\n",
    )
    .unwrap();

    let out = stratum(home.path(), &["recipe", ctx.path().to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("FROM python:3.12-slim"));
    assert!(text.contains(r#"CMD ["python", "-m", "telegram_bot.app"]"#));
}

#[test]
fn test_emitted_recipe_lints_clean() {
    let home = TempDir::new().unwrap();
    let ctx = service_context();
    let dockerfile = ctx.path().join("Dockerfile");

    let out = stratum(
        home.path(),
        &[
            "recipe",
            ctx.path().to_str().unwrap(),
            "-o",
            dockerfile.to_str().unwrap(),
        ],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(dockerfile.is_file());

    let out = stratum(home.path(), &["lint", ctx.path().to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("no findings"));
}

#[test]
fn test_lint_flags_source_before_install() {
    let home = TempDir::new().unwrap();
    let ctx = service_context();
    std::fs::write(
        ctx.path().join("Dockerfile"),
        "FROM python:3.11-slim\n\
         WORKDIR /app\n\
         ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1 PYTHONPATH=/app\n\
         COPY . .\n\
         RUN pip install --no-cache-dir -r telegram_bot/requirements.txt\n\
         CMD [\"python\", \"-m\", \"telegram_bot.main\"]\n",
    )
    .unwrap();

    let out = stratum(
        home.path(),
        &["lint", ctx.path().to_str().unwrap(), "--format", "json"],
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Error: 1 lint error(s)"));

    let findings: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    let codes: Vec<&str> = findings
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["STR-001"]);
}

#[test]
fn test_build_without_manifest_fails_fast() {
    let home = TempDir::new().unwrap();
    let ctx = service_context();
    std::fs::remove_file(ctx.path().join("telegram_bot/requirements.txt")).unwrap();

    let out = stratum(
        home.path(),
        &["build", ctx.path().to_str().unwrap(), "--offline", "-q"],
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Dependency manifest not found"));
    assert!(stdout(&out).is_empty());
}

#[test]
fn test_run_unknown_image() {
    let home = TempDir::new().unwrap();
    let out = stratum(home.path(), &["run", "telegram-bot:never-built"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Image not found: docker.io/library/telegram-bot:never-built"));
}

#[test]
fn test_images_empty_store() {
    let home = TempDir::new().unwrap();
    let out = stratum(home.path(), &["images", "-q"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).is_empty());
}
