//! Layer creation for build steps.
//!
//! Snapshots a root filesystem to find what a RUN step changed, and writes
//! reproducible tar.gz layers: entries sorted by path, mtime/uid/gid zeroed,
//! and a gzip header without timestamp. Identical inputs give identical
//! layer digests.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, Metadata};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use stratum_core::error::{Result, StratumError};

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Size in bytes
    pub size: u64,
    /// Modification time in nanoseconds since epoch
    pub mtime: i128,
    /// Permission bits
    pub mode: u32,
    pub is_dir: bool,
}

/// Recorded state of a directory tree.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Relative path → entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

impl DirSnapshot {
    /// Walk `root` without following symlinks.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Paths added or modified between `self` (before) and `after`, sorted.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                None => true,
                Some(before) => {
                    before.size != entry.size
                        || before.mtime != entry.mtime
                        || before.mode != entry.mode
                        || before.is_dir != entry.is_dir
                }
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StratumError::BuildError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| StratumError::BuildError(format!("Failed to strip prefix: {}", e)))?
            .to_path_buf();
        let metadata = std::fs::symlink_metadata(&path)?;

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        entries.insert(
            relative,
            FileEntry {
                size: metadata.len(),
                mtime,
                mode: file_mode(&metadata),
                is_dir: metadata.is_dir(),
            },
        );

        if metadata.is_dir() {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

/// Information about a created layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 of the compressed blob (hex, no prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar (hex, no prefix)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
}

impl LayerInfo {
    /// Digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Diff ID with "sha256:" prefix.
    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }
}

/// Hashes everything written through it.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Write a reproducible tar.gz layer holding `paths` (relative to `rootfs`)
/// and all of their ancestor directories.
///
/// Paths that no longer exist are skipped; so are sockets and fifos.
pub fn create_layer(rootfs: &Path, paths: &[PathBuf], output_path: &Path) -> Result<LayerInfo> {
    let mut selected = BTreeSet::new();
    for path in paths {
        let mut current = Some(path.as_path());
        while let Some(p) = current {
            if p.as_os_str().is_empty() {
                break;
            }
            selected.insert(p.to_path_buf());
            current = p.parent();
        }
    }

    let file = File::create(output_path).map_err(|e| {
        StratumError::BuildError(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;
    let writer = DigestWriter {
        inner: GzEncoder::new(file, Compression::default()),
        hasher: Sha256::new(),
    };
    let mut builder = tar::Builder::new(writer);

    for relative in &selected {
        append_entry(&mut builder, rootfs, relative).map_err(|e| {
            StratumError::BuildError(format!(
                "Failed to add {} to layer: {}",
                relative.display(),
                e
            ))
        })?;
    }

    let writer = builder
        .into_inner()
        .map_err(|e| StratumError::BuildError(format!("Failed to finalize layer: {}", e)))?;
    let diff_id = hex::encode(writer.hasher.finalize());
    writer
        .inner
        .finish()
        .map_err(|e| StratumError::BuildError(format!("Failed to finalize layer: {}", e)))?;

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path)?.len();

    tracing::debug!(
        layer = %output_path.display(),
        entries = selected.len(),
        digest = %digest,
        "Created layer"
    );

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest,
        diff_id,
        size,
    })
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    rootfs: &Path,
    relative: &Path,
) -> std::io::Result<()> {
    let full_path = rootfs.join(relative);
    let metadata = match std::fs::symlink_metadata(&full_path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(file_mode(&metadata));

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, relative, std::io::empty())
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(&full_path)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, relative, target)
    } else if file_type.is_file() {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        builder.append_data(&mut header, relative, File::open(&full_path)?)
    } else {
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// SHA256 of a file's contents (hex).
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        StratumError::BuildError(format!("Failed to open {} for hashing: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA256 of a byte slice (hex).
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn list_layer(path: &Path) -> Vec<(String, u64, u64)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let header = e.header();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    header.mtime().unwrap(),
                    header.uid().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_snapshot_diff_detects_added_and_modified() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("usr/lib")).unwrap();
        fs::write(tmp.path().join("usr/lib/a.py"), "a").unwrap();
        fs::write(tmp.path().join("usr/lib/b.py"), "b").unwrap();

        let before = DirSnapshot::capture(tmp.path()).unwrap();
        fs::write(tmp.path().join("usr/lib/b.py"), "bbbb").unwrap();
        fs::write(tmp.path().join("usr/lib/c.py"), "c").unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        let changed = before.diff(&after);
        assert!(changed.contains(&PathBuf::from("usr/lib/b.py")));
        assert!(changed.contains(&PathBuf::from("usr/lib/c.py")));
        assert!(!changed.contains(&PathBuf::from("usr/lib/a.py")));
    }

    #[test]
    fn test_snapshot_diff_empty_when_unchanged() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("x"), "x").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn test_create_layer_includes_ancestors_sorted() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("app/telegram_bot")).unwrap();
        fs::write(rootfs.join("app/telegram_bot/main.py"), "print()").unwrap();
        fs::write(rootfs.join("app/telegram_bot/__init__.py"), "").unwrap();

        let output = tmp.path().join("layer.tar.gz");
        let info = create_layer(
            &rootfs,
            &[
                PathBuf::from("app/telegram_bot/main.py"),
                PathBuf::from("app/telegram_bot/__init__.py"),
            ],
            &output,
        )
        .unwrap();

        let names: Vec<String> = list_layer(&output)
            .into_iter()
            .map(|(n, _, _)| n.trim_end_matches('/').to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "app",
                "app/telegram_bot",
                "app/telegram_bot/__init__.py",
                "app/telegram_bot/main.py",
            ]
        );
        assert_eq!(info.digest.len(), 64);
        assert_eq!(info.diff_id.len(), 64);
        assert_ne!(info.digest, info.diff_id);
        assert_eq!(info.size, fs::metadata(&output).unwrap().len());
    }

    #[test]
    fn test_create_layer_zeroes_mtime_and_owner() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("file"), "data").unwrap();
        let output = tmp.path().join("out.tar.gz");
        create_layer(tmp.path(), &[PathBuf::from("file")], &output).unwrap();

        for (_, mtime, uid) in list_layer(&output) {
            assert_eq!(mtime, 0);
            assert_eq!(uid, 0);
        }
    }

    #[test]
    fn test_create_layer_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let make = |name: &str| {
            let root = tmp.path().join(name);
            fs::create_dir_all(root.join("site-packages/aiogram")).unwrap();
            fs::write(root.join("site-packages/aiogram/__init__.py"), "v3").unwrap();
            root
        };
        let first = make("first");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = make("second");

        let paths = [PathBuf::from("site-packages/aiogram/__init__.py")];
        let a = create_layer(&first, &paths, &tmp.path().join("a.tar.gz")).unwrap();
        let b = create_layer(&second, &paths, &tmp.path().join("b.tar.gz")).unwrap();

        assert_eq!(a.digest, b.digest);
        assert_eq!(a.diff_id, b.diff_id);
    }

    #[test]
    fn test_create_layer_diff_id_matches_uncompressed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), "content").unwrap();
        let output = tmp.path().join("out.tar.gz");
        let info = create_layer(tmp.path(), &[PathBuf::from("f")], &output).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(File::open(&output).unwrap());
        let mut raw = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut raw).unwrap();
        assert_eq!(sha256_bytes(&raw), info.diff_id);
    }

    #[test]
    fn test_create_layer_skips_missing_paths() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("out.tar.gz");
        create_layer(tmp.path(), &[PathBuf::from("gone.txt")], &output).unwrap();
        assert!(list_layer(&output).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_layer_keeps_symlink() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("usr/local/bin")).unwrap();
        std::os::unix::fs::symlink("python3.11", tmp.path().join("usr/local/bin/python"))
            .unwrap();
        let output = tmp.path().join("out.tar.gz");
        create_layer(
            tmp.path(),
            &[PathBuf::from("usr/local/bin/python")],
            &output,
        )
        .unwrap();

        let file = File::open(&output).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let link = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.header().entry_type() == tar::EntryType::Symlink)
            .unwrap();
        assert_eq!(
            link.link_name().unwrap().unwrap().to_string_lossy(),
            "python3.11"
        );
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_prefixed_digest() {
        let info = LayerInfo {
            path: PathBuf::from("/tmp/x"),
            digest: "abc".to_string(),
            diff_id: "def".to_string(),
            size: 1,
        };
        assert_eq!(info.prefixed_digest(), "sha256:abc");
        assert_eq!(info.prefixed_diff_id(), "sha256:def");
    }
}
