//! Build engine.
//!
//! Runs a parsed build description step by step against a temporary
//! rootfs: resolves the base image, applies COPY and RUN steps as
//! stage-keyed cached layers, then assembles and stores the OCI image.
//! Any failure aborts the build and leaves the image store untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use stratum_core::error::{Result, StratumError};
use stratum_core::EnvSet;

use super::context::{BuildContext, EntryKind};
use super::dockerfile::{Dockerfile, Instruction};
use super::executor::{CommandRunner, RunInvocation};
use super::layer::{create_layer, DirSnapshot, LayerInfo};
use super::lint::{error_count, lint, LintOptions, Violation};
use super::phase::BuildPhase;
use super::stage::KeyChain;
use crate::cache::LayerCache;
use crate::oci::image::{write_layout, OciImage};
use crate::oci::layers::{extract_layer, extract_layers};
use crate::oci::pull::BaseImageSource;
use crate::oci::reference::ImageReference;
use crate::oci::store::{ImageOrigin, ImageStore};

/// Options for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build context directory
    pub context_dir: PathBuf,
    pub dockerfile: Dockerfile,
    /// Image tag, e.g. "telegram-bot:latest"
    pub tag: String,
    /// `--build-arg` overrides for ARG defaults
    pub build_args: BTreeMap<String, String>,
    /// Dependency manifest, relative to the context; checked before any
    /// step runs
    pub manifest: Option<PathBuf>,
    /// Skip cache lookups (results are still cached)
    pub no_cache: bool,
    /// Build even when lint reports errors
    pub allow_lint: bool,
    /// Image `created` timestamp; the Unix epoch when unset
    pub source_date_epoch: Option<i64>,
    /// Suppress progress output
    pub quiet: bool,
}

impl BuildConfig {
    pub fn new(context_dir: impl Into<PathBuf>, dockerfile: Dockerfile, tag: impl Into<String>) -> Self {
        Self {
            context_dir: context_dir.into(),
            dockerfile,
            tag: tag.into(),
            build_args: BTreeMap::new(),
            manifest: None,
            no_cache: false,
            allow_lint: false,
            source_date_epoch: None,
            quiet: false,
        }
    }
}

/// Cache outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Layer reused, step not executed
    Hit,
    /// Step executed and its layer cached
    Miss,
    /// Metadata-only step, no layer
    None,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Hit => write!(f, "hit"),
            CacheStatus::Miss => write!(f, "miss"),
            CacheStatus::None => write!(f, "-"),
        }
    }
}

/// What happened at one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub line: usize,
    /// Instruction after build-arg expansion
    pub instruction: String,
    /// Phase reached after the step
    pub phase: BuildPhase,
    pub cache: CacheStatus,
    /// Stage key of COPY and RUN steps
    pub key: Option<String>,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    /// Store key of the image
    pub reference: String,
    /// Manifest digest
    pub digest: String,
    pub size: u64,
    pub layer_count: usize,
    pub steps: Vec<StepReport>,
    /// RUN steps actually executed
    pub runner_invocations: usize,
    pub phase: BuildPhase,
    /// Lint findings that did not block the build
    pub warnings: Vec<Violation>,
}

impl BuildResult {
    pub fn cache_hits(&self) -> usize {
        self.steps.iter().filter(|s| s.cache == CacheStatus::Hit).count()
    }
}

/// Builds images into an [`ImageStore`].
pub struct Builder {
    store: Arc<ImageStore>,
    base: Arc<dyn BaseImageSource>,
    runner: Arc<dyn CommandRunner>,
    cache: LayerCache,
}

impl Builder {
    pub fn new(
        store: Arc<ImageStore>,
        base: Arc<dyn BaseImageSource>,
        runner: Arc<dyn CommandRunner>,
        cache: LayerCache,
    ) -> Self {
        Self {
            store,
            base,
            runner,
            cache,
        }
    }

    /// Run a build.
    ///
    /// Lint, the manifest check and COPY source checks run before the base
    /// image is resolved, so a broken context fails without pulling or
    /// executing anything.
    pub async fn build(&self, config: BuildConfig) -> Result<BuildResult> {
        let reference = ImageReference::parse(&config.tag).map_err(|e| {
            StratumError::BuildError(format!("Invalid image tag '{}': {}", config.tag, e))
        })?;

        let violations = lint(
            &config.dockerfile,
            &LintOptions {
                manifest: config.manifest.clone(),
            },
        );
        for v in &violations {
            tracing::warn!(code = v.code, line = v.line, severity = %v.severity, "{}", v.message);
            say(
                &config,
                format!("{} {} line {}: {} [{}]", v.severity, v.code, v.line, v.message, v.rule),
            );
        }
        let errors = error_count(&violations);
        if errors > 0 && !config.allow_lint {
            return Err(StratumError::LintFailed(errors));
        }

        let context = BuildContext::open(&config.context_dir)?;
        preflight(&context, &config)?;

        let build_dir = tempfile::TempDir::new().map_err(|e| {
            StratumError::BuildError(format!("Failed to create build directory: {}", e))
        })?;
        let rootfs = build_dir.path().join("rootfs");
        let layers_dir = build_dir.path().join("layers");
        std::fs::create_dir_all(&rootfs)?;
        std::fs::create_dir_all(&layers_dir)?;

        let mut state = BuildState::new(&config.build_args);
        let mut chain: Option<KeyChain> = None;
        let mut phase = BuildPhase::Pending;
        let mut reports = Vec::with_capacity(config.dockerfile.steps.len());
        let mut runner_invocations = 0;
        let manifest = config.manifest.as_deref();
        let total = config.dockerfile.steps.len();

        for (idx, step) in config.dockerfile.steps.iter().enumerate() {
            let n = idx + 1;
            let instruction = state.expand(&step.instruction);
            let text = instruction.to_string();
            say(&config, format!("Step {}/{}: {}", n, total, text));

            let mut cache = CacheStatus::None;
            let mut key = None;

            match &instruction {
                Instruction::From { image } => {
                    let base_ref = ImageReference::parse(image)?;
                    let base = self.base.resolve(&base_ref).await?;
                    state.apply_base(&base, &rootfs)?;
                    chain = Some(KeyChain::from_base(base.digest()));
                    say(&config, format!(" ---> {}", base.digest()));
                }

                Instruction::Copy { src, dst } => {
                    let input = context.digest(src)?;
                    let k = fold(&mut chain, &text, Some(input.as_str()), &state.env, &state.workdir)?;
                    let layer = match self.cached_layer(&config, &k, &rootfs)? {
                        Some(layer) => {
                            cache = CacheStatus::Hit;
                            layer
                        }
                        None => {
                            let paths = copy_into_rootfs(&context, src, dst, &state.workdir, &rootfs)?;
                            let layer = create_layer(&rootfs, &paths, &layers_dir.join(format!("{}.tar.gz", n)))?;
                            cache = CacheStatus::Miss;
                            self.cache.put(&k, &layer, &text)?.layer_info()
                        }
                    };
                    state.push_layer(layer, &text);
                    key = Some(k);
                }

                Instruction::Run { command } => {
                    let run_env = state.run_env();
                    let k = fold(&mut chain, &text, None, &run_env, &state.workdir)?;
                    let layer = match self.cached_layer(&config, &k, &rootfs)? {
                        Some(layer) => {
                            cache = CacheStatus::Hit;
                            layer
                        }
                        None => {
                            let before = DirSnapshot::capture(&rootfs)?;
                            self.runner.run(&RunInvocation {
                                step: n,
                                rootfs: &rootfs,
                                command,
                                workdir: &state.workdir,
                                env: &run_env,
                                verbose: !config.quiet,
                            })?;
                            runner_invocations += 1;
                            let changed = before.diff(&DirSnapshot::capture(&rootfs)?);
                            let layer = create_layer(&rootfs, &changed, &layers_dir.join(format!("{}.tar.gz", n)))?;
                            cache = CacheStatus::Miss;
                            self.cache.put(&k, &layer, &text)?.layer_info()
                        }
                    };
                    state.push_layer(layer, &text);
                    key = Some(k);
                }

                other => {
                    state.apply_metadata(other, &rootfs)?;
                    if chain.is_some() {
                        fold(&mut chain, &text, None, &state.env, &state.workdir)?;
                    }
                }
            }

            if cache == CacheStatus::Hit {
                say(&config, " ---> Using cache".to_string());
            }
            if let Some(k) = &key {
                tracing::info!(step = n, key = %k, cache = %cache, "Stage complete");
            }

            phase = phase.advance(&instruction, manifest);
            reports.push(StepReport {
                step: n,
                line: step.line,
                instruction: text,
                phase,
                cache,
                key,
            });
        }

        let unused: Vec<&String> = config
            .build_args
            .keys()
            .filter(|k| !state.declared_args.contains(*k))
            .collect();
        if !unused.is_empty() {
            tracing::warn!(args = ?unused, "Build args were not consumed by any ARG");
        }

        let output_dir = build_dir.path().join("image");
        let created = created_at(config.source_date_epoch);
        let image_config = state.image_config(&created);
        let layers: Vec<LayerInfo> = state
            .base_layers
            .iter()
            .chain(state.layers.iter())
            .cloned()
            .collect();
        let digest = write_layout(&output_dir, &image_config, &layers)?;

        let full_ref = reference.full_reference();
        let stored = self
            .store
            .put(&full_ref, &digest, &output_dir, ImageOrigin::Built)
            .await?;
        let evicted = self.store.evict().await?;
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), references = ?evicted, "Evicted images from store");
        }

        say(
            &config,
            format!(
                "Successfully built {} ({} layers, {})",
                full_ref,
                layers.len(),
                format_size(stored.size_bytes)
            ),
        );

        Ok(BuildResult {
            reference: full_ref,
            digest,
            size: stored.size_bytes,
            layer_count: layers.len(),
            steps: reports,
            runner_invocations,
            phase: BuildPhase::ImageReady,
            warnings: violations,
        })
    }

    /// Apply the cached layer for `key` to the rootfs, if there is one.
    fn cached_layer(&self, config: &BuildConfig, key: &str, rootfs: &Path) -> Result<Option<LayerInfo>> {
        if config.no_cache {
            return Ok(None);
        }
        match self.cache.get(key)? {
            Some(cached) => {
                extract_layer(&cached.path, rootfs)?;
                Ok(Some(cached.layer_info()))
            }
            None => Ok(None),
        }
    }
}

// =============================================================================
// Build state
// =============================================================================

/// A single history entry for the image config.
#[derive(Debug, Clone)]
struct HistoryEntry {
    created_by: String,
    empty_layer: bool,
}

struct BuildState {
    workdir: String,
    env: EnvSet,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    /// CMD came from the base image and is reset by ENTRYPOINT
    cmd_inherited: bool,
    labels: BTreeMap<String, String>,
    build_args: BTreeMap<String, String>,
    args: BTreeMap<String, String>,
    declared_args: BTreeSet<String>,
    architecture: String,
    base_layers: Vec<LayerInfo>,
    layers: Vec<LayerInfo>,
    history: Vec<HistoryEntry>,
}

impl BuildState {
    fn new(build_args: &BTreeMap<String, String>) -> Self {
        Self {
            workdir: "/".to_string(),
            env: EnvSet::new(),
            entrypoint: None,
            cmd: None,
            cmd_inherited: false,
            labels: BTreeMap::new(),
            build_args: build_args.clone(),
            args: BTreeMap::new(),
            declared_args: BTreeSet::new(),
            architecture: host_architecture().to_string(),
            base_layers: Vec::new(),
            layers: Vec::new(),
            history: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .map(str::to_string)
            .or_else(|| self.args.get(name).cloned())
    }

    /// Substitute `$VAR` and `${VAR}` from ENV and declared ARGs. Unknown
    /// references are left as written.
    fn expand(&self, instruction: &Instruction) -> Instruction {
        let x = |s: &str| expand_vars(s, &|name: &str| self.lookup(name));
        match instruction {
            Instruction::From { image } => Instruction::From { image: x(image) },
            Instruction::Workdir { path } => Instruction::Workdir { path: x(path) },
            Instruction::Env { vars } => Instruction::Env {
                vars: vars.iter().map(|(k, v)| (k.clone(), x(v))).collect(),
            },
            Instruction::Copy { src, dst } => Instruction::Copy {
                src: src.iter().map(|s| x(s)).collect(),
                dst: x(dst),
            },
            Instruction::Run { command } => Instruction::Run { command: x(command) },
            Instruction::Label { labels } => Instruction::Label {
                labels: labels.iter().map(|(k, v)| (k.clone(), x(v))).collect(),
            },
            Instruction::Arg { name, default } => Instruction::Arg {
                name: name.clone(),
                default: default.as_deref().map(x),
            },
            Instruction::Cmd { .. } | Instruction::Entrypoint { .. } => instruction.clone(),
        }
    }

    /// ENV plus declared ARGs, as seen by RUN steps. ENV wins.
    fn run_env(&self) -> EnvSet {
        let mut env: EnvSet = self
            .args
            .iter()
            .filter(|(k, _)| !self.env.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.merge(&self.env);
        env
    }

    fn apply_base(&mut self, base: &OciImage, rootfs: &Path) -> Result<()> {
        if base.diff_ids().len() != base.layer_paths().len() {
            return Err(StratumError::OciImageError(format!(
                "Base image {} lists {} layers but {} diff_ids",
                base.digest(),
                base.layer_paths().len(),
                base.diff_ids().len()
            )));
        }
        extract_layers(base.layer_paths(), rootfs)?;

        self.base_layers = base
            .layer_paths()
            .iter()
            .zip(base.diff_ids())
            .map(|(path, diff_id)| LayerInfo {
                path: path.clone(),
                digest: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                diff_id: diff_id.strip_prefix("sha256:").unwrap_or(diff_id).to_string(),
                size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            })
            .collect();

        let config = base.config();
        self.env = config.env.clone();
        self.entrypoint = config.entrypoint.clone();
        self.cmd = config.cmd.clone();
        self.cmd_inherited = self.cmd.is_some();
        self.labels = config.labels.clone();
        if let Some(wd) = config.working_dir.as_deref().filter(|wd| !wd.is_empty()) {
            self.workdir = wd.to_string();
        }
        if !config.architecture.is_empty() {
            self.architecture = config.architecture.clone();
        }

        self.history.push(HistoryEntry {
            created_by: format!("FROM {}", base.digest()),
            empty_layer: true,
        });
        Ok(())
    }

    fn apply_metadata(&mut self, instruction: &Instruction, rootfs: &Path) -> Result<()> {
        match instruction {
            Instruction::Workdir { path } => {
                self.workdir = resolve_path(&self.workdir, path);
                let full = rootfs.join(self.workdir.trim_start_matches('/'));
                std::fs::create_dir_all(&full).map_err(|e| {
                    StratumError::BuildError(format!(
                        "Failed to create WORKDIR {}: {}",
                        self.workdir, e
                    ))
                })?;
            }
            Instruction::Env { vars } => {
                for (k, v) in vars {
                    self.env.set(k.clone(), v.clone());
                }
            }
            Instruction::Label { labels } => {
                for (k, v) in labels {
                    self.labels.insert(k.clone(), v.clone());
                }
            }
            Instruction::Cmd { exec } => {
                self.cmd = Some(exec.clone());
                self.cmd_inherited = false;
            }
            Instruction::Entrypoint { exec } => {
                self.entrypoint = Some(exec.clone());
                if self.cmd_inherited {
                    self.cmd = None;
                    self.cmd_inherited = false;
                }
            }
            Instruction::Arg { name, default } => {
                self.declared_args.insert(name.clone());
                if let Some(value) = self.build_args.get(name).or(default.as_ref()) {
                    self.args.insert(name.clone(), value.clone());
                }
            }
            Instruction::From { .. } | Instruction::Copy { .. } | Instruction::Run { .. } => {
                return Err(StratumError::BuildError(format!(
                    "{} is not a metadata instruction",
                    instruction.keyword()
                )));
            }
        }

        // ARG before FROM belongs to no image
        if !self.history.is_empty() {
            self.history.push(HistoryEntry {
                created_by: instruction.to_string(),
                empty_layer: true,
            });
        }
        Ok(())
    }

    fn push_layer(&mut self, layer: LayerInfo, created_by: &str) {
        self.layers.push(layer);
        self.history.push(HistoryEntry {
            created_by: created_by.to_string(),
            empty_layer: false,
        });
    }

    /// OCI image config document. Key order and content depend only on
    /// the build inputs.
    fn image_config(&self, created: &str) -> serde_json::Value {
        let mut container = serde_json::Map::new();
        if !self.env.is_empty() {
            container.insert("Env".into(), serde_json::json!(self.env.to_oci_list()));
        }
        if let Some(ep) = &self.entrypoint {
            container.insert("Entrypoint".into(), serde_json::json!(ep));
        }
        if let Some(cmd) = &self.cmd {
            container.insert("Cmd".into(), serde_json::json!(cmd));
        }
        if self.workdir != "/" {
            container.insert("WorkingDir".into(), serde_json::json!(self.workdir));
        }
        if !self.labels.is_empty() {
            container.insert("Labels".into(), serde_json::json!(self.labels));
        }

        let diff_ids: Vec<String> = self
            .base_layers
            .iter()
            .chain(self.layers.iter())
            .map(LayerInfo::prefixed_diff_id)
            .collect();

        let history: Vec<serde_json::Value> = self
            .history
            .iter()
            .map(|h| {
                let mut entry = serde_json::json!({
                    "created": created,
                    "created_by": h.created_by,
                });
                if h.empty_layer {
                    entry["empty_layer"] = serde_json::json!(true);
                }
                entry
            })
            .collect();

        serde_json::json!({
            "architecture": self.architecture,
            "os": "linux",
            "created": created,
            "config": container,
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
            "history": history,
        })
    }
}

// =============================================================================
// COPY
// =============================================================================

/// Copy COPY sources from the context into the rootfs with Docker's
/// destination rules. Returns the rootfs-relative paths written.
fn copy_into_rootfs(
    context: &BuildContext,
    sources: &[String],
    dst: &str,
    workdir: &str,
    rootfs: &Path,
) -> Result<Vec<PathBuf>> {
    let dst_rel = PathBuf::from(resolve_path(workdir, dst).trim_start_matches('/'));
    let dst_is_dir = dst.ends_with('/')
        || matches!(dst, "." | "./")
        || sources.len() > 1
        || rootfs.join(&dst_rel).is_dir();

    let mut written = Vec::new();
    if dst_is_dir {
        make_dir(&rootfs.join(&dst_rel))?;
        written.push(dst_rel.clone());
    }

    for src in sources {
        let src_rel = context.resolve(src)?;
        let src_full = context.root().join(&src_rel);
        let src_meta = std::fs::symlink_metadata(&src_full)
            .map_err(|e| StratumError::CopyFailed(format!("{}: {}", src, e)))?;

        if src_meta.is_dir() {
            make_dir(&rootfs.join(&dst_rel))?;
            written.push(dst_rel.clone());
            for entry in context.entries(src)? {
                let rel = entry.rel.strip_prefix(&src_rel).unwrap_or(&entry.rel);
                let target_rel = dst_rel.join(rel);
                place(&context.root().join(&entry.rel), rootfs, &target_rel, entry.kind)?;
                written.push(target_rel);
            }
        } else {
            let target_rel = if dst_is_dir {
                match src_rel.file_name() {
                    Some(name) => dst_rel.join(name),
                    None => dst_rel.clone(),
                }
            } else {
                dst_rel.clone()
            };
            let kind = if src_meta.file_type().is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            place(&src_full, rootfs, &target_rel, kind)?;
            written.push(target_rel);
        }
    }

    written.retain(|p| !p.as_os_str().is_empty());
    written.sort();
    written.dedup();
    Ok(written)
}

fn make_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        StratumError::CopyFailed(format!("Failed to create {}: {}", path.display(), e))
    })
}

fn place(source: &Path, rootfs: &Path, target_rel: &Path, kind: EntryKind) -> Result<()> {
    let target = rootfs.join(target_rel);
    let copy_err = |e: std::io::Error| {
        StratumError::CopyFailed(format!(
            "Failed to copy {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    };

    if let Some(parent) = target.parent() {
        make_dir(parent)?;
    }

    match kind {
        EntryKind::Dir => {
            make_dir(&target)?;
            let perms = std::fs::metadata(source).map_err(copy_err)?.permissions();
            std::fs::set_permissions(&target, perms).map_err(copy_err)?;
        }
        EntryKind::File => {
            if target.is_symlink() {
                std::fs::remove_file(&target).map_err(copy_err)?;
            }
            std::fs::copy(source, &target).map_err(copy_err)?;
        }
        EntryKind::Symlink => {
            let link = std::fs::read_link(source).map_err(copy_err)?;
            if std::fs::symlink_metadata(&target).is_ok() {
                std::fs::remove_file(&target).map_err(copy_err)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).map_err(copy_err)?;
            #[cfg(not(unix))]
            return Err(StratumError::CopyFailed(format!(
                "cannot copy symlink {} -> {} on this platform",
                source.display(),
                link.display()
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Fail before touching anything: the manifest must exist and every COPY
/// source must be present in the context.
fn preflight(context: &BuildContext, config: &BuildConfig) -> Result<()> {
    if let Some(manifest) = &config.manifest {
        context.check_manifest(manifest)?;
    }

    let mut state = BuildState::new(&config.build_args);
    for step in &config.dockerfile.steps {
        match state.expand(&step.instruction) {
            Instruction::Copy { src, .. } => {
                for s in &src {
                    context.entries(s)?;
                }
            }
            Instruction::Env { vars } => {
                for (k, v) in vars {
                    state.env.set(k, v);
                }
            }
            arg @ Instruction::Arg { .. } => state.apply_metadata(&arg, Path::new("/"))?,
            _ => {}
        }
    }
    Ok(())
}

fn fold(
    chain: &mut Option<KeyChain>,
    text: &str,
    input: Option<&str>,
    env: &EnvSet,
    workdir: &str,
) -> Result<String> {
    let chain = chain.as_mut().ok_or_else(|| {
        StratumError::BuildError(format!("'{}' appears before FROM", text))
    })?;
    Ok(chain.fold(text, input, env, workdir).to_string())
}

fn say(config: &BuildConfig, line: String) {
    if !config.quiet {
        println!("{}", line);
    }
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn created_at(source_date_epoch: Option<i64>) -> String {
    let ts: DateTime<Utc> = source_date_epoch
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_default();
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Resolve `path` against `workdir` into a normalised absolute path.
fn resolve_path(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(workdir).join(path)
    };

    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Expand `$NAME` and `${NAME}` with `lookup`; unresolved references stay
/// verbatim.
fn expand_vars(s: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = match after.strip_prefix('{') {
            Some(body) => match body.find('}') {
                Some(end) => (&body[..end], end + 2),
                None => ("", 0),
            },
            None => {
                let len = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..len], len)
            }
        };

        match Some(name).filter(|n| is_var_name(n)).and_then(lookup) {
            Some(value) => {
                out.push_str(&value);
                rest = &after[consumed..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
