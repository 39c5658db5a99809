//! Content-addressed store layout.
//!
//! Everything the server persists lives under one cache root:
//!
//! ```text
//! blobs/sha256:<hex>                    every blob, named by digest
//! manifests/<repo>/<tag>/manifest.json  named pointer to a manifest blob
//! links/<mount>/<inputHash>/link        layer link records
//! tmp/                                  in-progress writes and staging
//! ```
//!
//! Blobs are write-once and idempotent by content address; tag pointers
//! are overwrite-via-rename.

use std::fs;
use std::path::{Path, PathBuf};

use stratum_core::atomic;
use stratum_core::{Error, Result};

/// Resolves cache paths and persists small blobs.
pub struct Store {
    blobs: PathBuf,
    manifests: PathBuf,
    links: PathBuf,
    tmp: PathBuf,
    model_blobs: PathBuf,
}

impl Store {
    /// Open a store at `root`, creating the directory skeleton.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            blobs: root.join("blobs"),
            manifests: root.join("manifests"),
            links: root.join("links"),
            tmp: root.join("tmp"),
            model_blobs: root.join("tmp").join("models").join("blobs"),
        };

        for dir in [
            &store.blobs,
            &store.manifests,
            &store.links,
            &store.tmp,
            &store.model_blobs,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Internal(format!(
                    "creating cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(store)
    }

    /// Path of a blob. Bare 64-hex digests get the `sha256:` prefix; an
    /// already-prefixed digest is used verbatim.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        if digest.contains(':') {
            self.blobs.join(digest)
        } else {
            self.blobs.join(format!("sha256:{digest}"))
        }
    }

    /// Path of the named manifest pointer for `repo:tag`.
    pub fn manifest_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.manifests.join(repository).join(tag).join("manifest.json")
    }

    /// Path of the link record for a mutate's mount and input hash.
    pub fn link_path(&self, mount: &str, input_hash: &str) -> PathBuf {
        self.links
            .join(mount.trim_start_matches('/'))
            .join(input_hash)
            .join("link")
    }

    /// Staging directory for in-progress work.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// The blob directory itself. Layer assembly stages its temp file
    /// here so the final rename stays within one filesystem directory.
    pub fn blobs_dir(&self) -> &Path {
        &self.blobs
    }

    /// Staging path for a model blob, keyed by digest.
    pub fn model_blob_path(&self, digest: &str) -> PathBuf {
        self.model_blobs.join(digest)
    }

    /// Whether a blob with this digest exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Persist a small blob (manifest, index, config) by its content.
    ///
    /// Returns the prefixed digest. Writing an already-present digest is
    /// a no-op.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let digest = format!("sha256:{}", atomic::sha256_hex(data));
        let path = self.blob_path(&digest);
        if !path.is_file() {
            atomic::write_file(&path, data)?;
        }
        Ok(digest)
    }

    /// Install the named tag pointer for `repo:tag`.
    pub fn write_tag(&self, repository: &str, tag: &str, manifest: &[u8]) -> Result<()> {
        atomic::write_file(&self.manifest_path(repository, tag), manifest)
    }
}
