//! Build context access.
//!
//! Resolves COPY sources inside the context directory, applies
//! `.dockerignore` rules, and computes the content digest that keys COPY
//! stages in the layer cache.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use stratum_core::error::{Result, StratumError};

use super::layer::file_mode;

/// Ignore file read from the context root.
pub const IGNORE_FILE: &str = ".dockerignore";

/// Always excluded: VCS metadata, interpreter caches, local secrets and the
/// service's runtime log.
const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    "**/__pycache__",
    "**/*.pyc",
    "**/.env",
    "telegram_bot/bot.log",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct IgnorePattern {
    pattern: Pattern,
    negate: bool,
    dir_only: bool,
}

/// Ordered ignore patterns; the last matching pattern decides.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreRules {
    pub fn defaults() -> Result<Self> {
        let mut rules = Self {
            patterns: Vec::new(),
        };
        for line in DEFAULT_IGNORES {
            rules.push_line(line, 0)?;
        }
        Ok(rules)
    }

    /// Defaults followed by the patterns in `content`.
    pub fn parse(content: &str) -> Result<Self> {
        let mut rules = Self::defaults()?;
        for (idx, line) in content.lines().enumerate() {
            rules.push_line(line, idx + 1)?;
        }
        Ok(rules)
    }

    fn push_line(&mut self, line: &str, line_num: usize) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let (negate, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        let dir_only = body.ends_with('/');
        let body = body.trim_start_matches("./").trim_matches('/');
        if body.is_empty() {
            return Ok(());
        }

        let pattern = Pattern::new(body).map_err(|e| StratumError::Parse {
            line: line_num,
            message: format!("{}: invalid pattern '{}': {}", IGNORE_FILE, body, e),
        })?;
        self.patterns.push(IgnorePattern {
            pattern,
            negate,
            dir_only,
        });
        Ok(())
    }

    /// Whether `rel` (context-relative) is excluded, either directly or
    /// because one of its ancestor directories is.
    pub fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        let mut ancestors: Vec<&Path> = rel
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        ancestors.reverse();

        let last = ancestors.len().saturating_sub(1);
        ancestors
            .iter()
            .enumerate()
            .any(|(i, path)| self.matches(path, i < last || is_dir))
    }

    fn matches(&self, rel: &Path, is_dir: bool) -> bool {
        let mut ignored = false;
        for p in &self.patterns {
            if p.dir_only && !is_dir {
                continue;
            }
            if p.pattern.matches_path_with(rel, MATCH_OPTIONS) {
                ignored = !p.negate;
            }
        }
        ignored
    }
}

/// Kind of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// A path inside the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the context root
    pub rel: PathBuf,
    pub kind: EntryKind,
}

/// Build context directory with its ignore rules.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    ignore: IgnoreRules,
}

impl BuildContext {
    /// Open a context directory, reading `.dockerignore` when present.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            StratumError::BuildError(format!(
                "Build context {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(StratumError::BuildError(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        let ignore_path = root.join(IGNORE_FILE);
        let ignore = if ignore_path.is_file() {
            IgnoreRules::parse(&std::fs::read_to_string(&ignore_path)?)?
        } else {
            IgnoreRules::defaults()?
        };

        Ok(Self { root, ignore })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Normalise a COPY source to a context-relative path. A leading `/`
    /// means the context root; `..` may not climb out of the context.
    pub fn resolve(&self, src: &str) -> Result<PathBuf> {
        let mut out = PathBuf::new();
        for component in Path::new(src).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::ParentDir => {
                    if !out.pop() {
                        return Err(StratumError::CopyFailed(format!(
                            "source '{}' is outside the build context",
                            src
                        )));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(out)
    }

    /// Whether a COPY source exists in the context and is not excluded.
    pub fn contains(&self, src: &str) -> Result<bool> {
        let rel = self.resolve(src)?;
        let full = self.root.join(&rel);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) => Ok(rel.as_os_str().is_empty() || !self.ignore.is_ignored(&rel, meta.is_dir())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Entries selected by a COPY source, sorted by path.
    ///
    /// A file source yields itself. A directory source yields everything
    /// beneath it (not the directory itself), minus ignored paths.
    pub fn entries(&self, src: &str) -> Result<Vec<ContextEntry>> {
        let rel = self.resolve(src)?;
        let full = self.root.join(&rel);
        let meta = std::fs::symlink_metadata(&full).map_err(|_| {
            StratumError::CopyFailed(format!(
                "source '{}' not found in build context {}",
                src,
                self.root.display()
            ))
        })?;

        if !rel.as_os_str().is_empty() && self.ignore.is_ignored(&rel, meta.is_dir()) {
            return Err(StratumError::CopyFailed(format!(
                "source '{}' is excluded by {}",
                src, IGNORE_FILE
            )));
        }

        if !meta.is_dir() {
            return Ok(vec![ContextEntry {
                rel,
                kind: kind_of(&meta),
            }]);
        }

        let mut entries = Vec::new();
        self.walk(&rel, &mut entries)?;
        Ok(entries)
    }

    fn walk(&self, dir_rel: &Path, out: &mut Vec<ContextEntry>) -> Result<()> {
        let mut children: Vec<_> = std::fs::read_dir(self.root.join(dir_rel))?
            .collect::<std::io::Result<Vec<_>>>()?;
        children.sort_by_key(|e| e.file_name());

        for child in children {
            let rel = dir_rel.join(child.file_name());
            let meta = std::fs::symlink_metadata(child.path())?;
            if self.ignore.is_ignored(&rel, meta.is_dir()) {
                continue;
            }
            let kind = kind_of(&meta);
            out.push(ContextEntry {
                rel: rel.clone(),
                kind,
            });
            if kind == EntryKind::Dir {
                self.walk(&rel, out)?;
            }
        }
        Ok(())
    }

    /// Content digest of everything the given COPY sources select: paths,
    /// kinds, permission bits, file contents and link targets.
    pub fn digest(&self, sources: &[String]) -> Result<String> {
        let mut hasher = Sha256::new();
        for src in sources {
            hasher.update(b"src\0");
            hasher.update(src.as_bytes());
            hasher.update(b"\0");

            for entry in self.entries(src)? {
                let full = self.root.join(&entry.rel);
                let meta = std::fs::symlink_metadata(&full)?;
                hasher.update(entry.rel.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(format!("{:?}:{:o}\0", entry.kind, file_mode(&meta)).as_bytes());
                match entry.kind {
                    EntryKind::File => {
                        let mut file = std::fs::File::open(&full)?;
                        std::io::copy(&mut file, &mut hasher)?;
                    }
                    EntryKind::Symlink => {
                        let target = std::fs::read_link(&full)?;
                        hasher.update(target.to_string_lossy().as_bytes());
                    }
                    EntryKind::Dir => {}
                }
                hasher.update(b"\0");
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Check that the dependency manifest is present and readable as
    /// UTF-8 text.
    pub fn check_manifest(&self, manifest: &Path) -> Result<()> {
        let missing = || StratumError::ManifestMissing {
            path: manifest.to_path_buf(),
        };

        let src = manifest.to_string_lossy();
        if !self.contains(&src)? {
            return Err(missing());
        }
        let full = self.root.join(self.resolve(&src)?);
        if !full.is_file() {
            return Err(StratumError::ManifestInvalid {
                path: manifest.to_path_buf(),
                message: "not a regular file".to_string(),
            });
        }

        let bytes = std::fs::read(&full)?;
        String::from_utf8(bytes).map_err(|e| StratumError::ManifestInvalid {
            path: manifest.to_path_buf(),
            message: format!("not valid UTF-8: {}", e),
        })?;
        Ok(())
    }
}

fn kind_of(meta: &std::fs::Metadata) -> EntryKind {
    let ft = meta.file_type();
    if ft.is_dir() {
        EntryKind::Dir
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}
