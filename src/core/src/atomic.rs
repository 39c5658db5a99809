//! Atomic file writing.
//!
//! Every persistent write in the cache goes through the same sequence:
//! create the parent directories, write into a temp file in the same
//! directory, then rename into place. A write that errors out (or is
//! dropped mid-way) leaves no partial file behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A file handle that becomes visible at its target path only on
/// [`AtomicFile::commit`]. Dropping an uncommitted handle removes the
/// temp file.
pub struct AtomicFile {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl AtomicFile {
    /// Open a temp file next to `target`, creating parent directories.
    pub fn create(target: &Path) -> Result<Self> {
        let dir = target.parent().ok_or_else(|| {
            Error::Internal(format!("no parent directory for {}", target.display()))
        })?;
        fs::create_dir_all(dir)?;

        let base = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = dir.join(format!(
            "tmp-{}-{}-{}",
            base,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        let file = fs::File::create(&tmp_path)?;

        Ok(Self {
            file: Some(file),
            tmp_path,
            target: target.to_path_buf(),
            committed: false,
        })
    }

    /// Close the temp file and rename it into place.
    pub fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        fs::rename(&self.tmp_path, &self.target)?;
        self.committed = true;
        Ok(())
    }

    /// Close and remove the temp file without touching the target.
    pub fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path);
        self.committed = true;
    }

    /// The path the file will be renamed to on commit.
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(std::io::Error::other("atomic file already closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Atomically write `data` to `file`.
pub fn write_file(file: &Path, data: &[u8]) -> Result<()> {
    let mut f = AtomicFile::create(file)?;
    f.write_all(data)?;
    f.commit()
}

/// Hex-encoded sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
