//! Layer link records.
//!
//! A link record remembers the `(digest, diffID, size)` of a layer built
//! from deterministic inputs, keyed by a hash of those inputs. When the
//! same inputs come around again the tar assembly and hashing are skipped
//! entirely and the recorded layer is reused.

use std::path::Path;

use stratum_core::atomic;
use stratum_core::{Error, Result};

/// The `(digest, diffID, size)` triple recorded for a built layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    /// Digest of the compressed layer, `sha256:` prefixed.
    pub digest: String,
    /// Digest of the uncompressed tar, `sha256:` prefixed.
    pub diff_id: String,
    /// Compressed byte length.
    pub size: i64,
}

impl LinkRecord {
    /// Encode as the on-disk text form `"<digest> <diffID> <size>"`.
    pub fn encode(&self) -> String {
        format!("{} {} {}", self.digest, self.diff_id, self.size)
    }

    /// Decode the on-disk text form.
    pub fn decode(text: &str) -> Result<Self> {
        let mut fields = text.split_whitespace();
        let (digest, diff_id, size) = match (fields.next(), fields.next(), fields.next()) {
            (Some(d), Some(f), Some(s)) => (d, f, s),
            _ => {
                return Err(Error::Internal(format!("malformed link record {text:?}")));
            }
        };

        for value in [digest, diff_id] {
            if !value.starts_with("sha256:") {
                return Err(Error::Internal(format!("malformed link digest {value:?}")));
            }
        }

        Ok(Self {
            digest: digest.to_string(),
            diff_id: diff_id.to_string(),
            size: size
                .parse()
                .map_err(|_| Error::Internal(format!("malformed link size {size:?}")))?,
        })
    }
}

/// Input hash for a file mutate: `sha256(source ⊕ 0x00 ⊕ destination ⊕ 0x00 ⊕ mode)`.
pub fn file_input_hash(source: &str, destination: &str, mode: &str) -> String {
    atomic::sha256_hex(format!("{source}\0{destination}\0{mode}").as_bytes())
}

/// Input hash for a model mutate: `sha256(model ⊕ 0x00 ⊕ workDir)`.
pub fn model_input_hash(model: &str, work_dir: &str) -> String {
    atomic::sha256_hex(format!("{model}\0{work_dir}").as_bytes())
}

/// Read a link record, returning `None` when absent or unreadable.
pub fn read(path: &Path) -> Option<LinkRecord> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "reading link record");
            return None;
        }
    };

    match LinkRecord::decode(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "decoding link record");
            None
        }
    }
}

/// Write a link record. Failures are logged, not fatal: the layer blob is
/// already committed and the record is only an optimization.
pub fn write(path: &Path, record: &LinkRecord) {
    if let Err(e) = atomic::write_file(path, record.encode().as_bytes()) {
        tracing::warn!(path = %path.display(), error = %e, "writing link record");
    }
}
