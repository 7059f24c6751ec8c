//! Filesystem access for envelope key directories.

use getrandom::fill;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A directory holding one file per envelope field.
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    path: PathBuf,
}

impl KeyDirectory {
    /// Creates a new KeyDirectory for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `true` if the directory exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the path to the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.file(name).exists()
    }

    /// Creates the directory with mode 0700.
    ///
    /// # Errors
    ///
    /// Fails if the directory already exists or cannot be created.
    pub fn create(&self) -> Result<()> {
        DirBuilder::new()
            .mode(0o700)
            .create(&self.path)
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Reads one field into memory.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file(name);
        fs::read(&path).map_err(|e| Error::io(path, e))
    }

    pub fn read_string(&self, name: &str) -> Result<String> {
        let bytes = self.read(name)?;
        String::from_utf8(bytes).map_err(|_| Error::Format(format!("{name} is not valid UTF-8")))
    }

    /// Replaces one field atomically.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        write_file(&self.file(name), data)
    }
}

/// Replaces `target` atomically.
///
/// The data goes to a synced sibling temp file first, which is then
/// renamed over the target; the parent directory is synced afterwards. A
/// crash leaves either the old or the new contents.
pub fn write_file(target: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = random_tmp_path(target)?;

    // securely create temp file (fail if exists)
    let mut tmp_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp_path)
        .map_err(|e| Error::io(&tmp_path, e))?;

    tmp_file
        .write_all(data)
        .and_then(|_| tmp_file.sync_all())
        .map_err(|e| Error::io(&tmp_path, e))?;
    drop(tmp_file);

    if let Err(e) = fs::rename(&tmp_path, target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::io(target, e));
    }

    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Renames `from` onto `to`, then syncs the parent of `to`.
pub fn rename_dir(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| Error::io(to, e))?;
    match to.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

/// Creates `path` and its parents with mode 0700.
pub fn create_dir_all(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| Error::io(path, e))
}

fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).map_err(|e| Error::io(path, e))?;
    dir.sync_all().map_err(|e| Error::io(path, e))
}

/// Generates a unique temporary file path next to `target`.
///
/// Format: `filename.tmp.<randomhex>`
fn random_tmp_path(target: &Path) -> Result<PathBuf> {
    let mut buf = [0u8; 8]; // 64 bit entropy
    fill(&mut buf).map_err(|_| Error::Crypto("OS random generator unavailable".into()))?;

    let file_name = target
        .file_name()
        .ok_or_else(|| Error::Format(format!("{} has no file name", target.display())))?
        .to_string_lossy();

    let tmp_name = format!("{}.tmp.{}", file_name, hex::encode(buf));

    Ok(target.with_file_name(tmp_name))
}
