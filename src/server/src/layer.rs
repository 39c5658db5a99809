//! Tar layer assembly.
//!
//! A mutate expands into a flat list of `(path-in-tar, size, source)`
//! entries, which are then streamed into one uncompressed tar. Entries
//! carry a constant mode and modification time, so identical inputs
//! produce byte-identical tars, stable digests, and a usable link cache.
//! The tar stream is teed: gzip bytes land in the blob store while two
//! sha256 accumulators produce the layer digest (compressed) and diffID
//! (uncompressed).

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use url::Url;

use stratum_core::atomic::{sha256_hex, AtomicFile};
use stratum_core::{Error, Result};

use crate::store::Store;

/// Mode used when a file mutate does not specify one.
pub const DEFAULT_MODE: u32 = 0o644;

/// One file to be written into a layer tar.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Path inside the tar.
    pub path: String,
    /// Exact byte size; a source yielding fewer bytes is fatal.
    pub size: u64,
    pub source: Source,
}

/// Where an entry's bytes come from at streaming time.
#[derive(Debug, Clone)]
pub enum Source {
    /// A local file (includes staged downloads).
    Local(PathBuf),
    /// In-memory bytes (model manifests and configs).
    Bytes(Vec<u8>),
}

/// A committed layer blob.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    /// Digest of the compressed blob, `sha256:` prefixed.
    pub digest: String,
    /// Digest of the uncompressed tar, `sha256:` prefixed.
    pub diff_id: String,
    /// Compressed byte length.
    pub size: i64,
    pub media_type: String,
}

/// Parse an octal-by-default mode string (`"0644"`, `"0o755"`, `"420"`).
///
/// Empty means [`DEFAULT_MODE`]; leading `0` selects octal, `0x` hex,
/// otherwise decimal.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let mode = mode.trim();
    if mode.is_empty() {
        return Ok(DEFAULT_MODE);
    }

    let parsed = if let Some(hex) = mode.strip_prefix("0x").or_else(|| mode.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(octal) = mode.strip_prefix("0o").or_else(|| mode.strip_prefix("0O")) {
        u32::from_str_radix(octal, 8)
    } else if mode.starts_with('0') {
        u32::from_str_radix(mode, 8)
    } else {
        mode.parse()
    };

    parsed.map_err(|_| Error::ConfigInvalid(format!("invalid file mode {mode:?}")))
}

/// Builds one layer per mutate.
pub struct LayerBuilder<'a> {
    store: &'a Store,
    http: reqwest::Client,
    mode: u32,
    mtime: u64,
}

impl<'a> LayerBuilder<'a> {
    /// Mod time defaults to the epoch so output bytes are reproducible.
    pub fn new(store: &'a Store, mode: u32) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            mode,
            mtime: 0,
        }
    }

    /// Expand a file mutate's source into tar entries.
    pub async fn expand_file(&self, source: &str, destination: &str) -> Result<Vec<Entry>> {
        if let Ok(url) = Url::parse(source) {
            if url.scheme() == "http" || url.scheme() == "https" {
                return Ok(vec![self.expand_remote(url, destination).await?]);
            }
        }
        self.expand_local(source, destination)
    }

    fn expand_local(&self, source: &str, destination: &str) -> Result<Vec<Entry>> {
        let path = Path::new(source);
        let meta = fs::metadata(path)
            .map_err(|e| Error::ConfigInvalid(format!("source {source:?}: {e}")))?;

        if meta.is_dir() {
            let mut entries = Vec::new();
            walk_dir(path, destination.trim_end_matches('/'), &mut entries)?;
            return Ok(entries);
        }

        let tar_path = if destination.ends_with('/') {
            join_tar_path(destination, &basename(path))
        } else {
            destination.to_string()
        };
        Ok(vec![Entry {
            path: tar_path,
            size: meta.len(),
            source: Source::Local(path.to_path_buf()),
        }])
    }

    /// HEAD the URL (a positive content length is required), stage the
    /// body under `tmp/`, and emit a single entry.
    async fn expand_remote(&self, url: Url, destination: &str) -> Result<Entry> {
        let tar_path = if destination.ends_with('/') {
            let name = url
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!("cannot derive a file name from {url}"))
                })?
                .to_string();
            join_tar_path(destination, &name)
        } else {
            destination.to_string()
        };

        let head = self
            .http
            .head(url.clone())
            .send()
            .await
            .map_err(|e| remote_error(&url, &e))?;
        if !head.status().is_success() {
            return Err(Error::Upstream {
                reference: url.to_string(),
                message: format!("status code {}", head.status().as_u16()),
                status: Some(head.status().as_u16()),
            });
        }
        match head.content_length() {
            Some(n) if n > 0 => {}
            _ => {
                return Err(Error::Upstream {
                    reference: url.to_string(),
                    message: "content length is unknown".to_string(),
                    status: None,
                });
            }
        }

        let staged = self
            .store
            .tmp_dir()
            .join("remote")
            .join(sha256_hex(url.as_str().as_bytes()));
        if !staged.is_file() {
            self.stage_remote(&url, &staged).await?;
        }

        let size = fs::metadata(&staged)?.len();
        Ok(Entry {
            path: tar_path,
            size,
            source: Source::Local(staged),
        })
    }

    async fn stage_remote(&self, url: &Url, staged: &Path) -> Result<()> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| remote_error(url, &e))?;
        if !response.status().is_success() {
            return Err(Error::Upstream {
                reference: url.to_string(),
                message: format!("status code {}", response.status().as_u16()),
                status: Some(response.status().as_u16()),
            });
        }

        let mut out = AtomicFile::create(staged)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| remote_error(url, &e))?;
            out.write_all(&chunk)?;
        }
        out.commit()
    }

    /// Stream the entries into a gzip tar blob and commit it to the store.
    pub async fn build(&self, entries: Vec<Entry>, media_type: &str) -> Result<BuiltLayer> {
        let blobs_dir = self.store.blobs_dir().to_path_buf();
        let mode = self.mode;
        let mtime = self.mtime;

        let (tmp_path, digest, diff_id, size) =
            tokio::task::spawn_blocking(move || assemble(&entries, mode, mtime, &blobs_dir))
                .await
                .map_err(|e| Error::Internal(format!("layer assembly task: {e}")))??;

        if size <= 0 {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::ConfigInvalid("zero-size layer".to_string()));
        }

        let target = self.store.blob_path(&digest);
        fs::rename(&tmp_path, &target)?;
        tracing::debug!(digest = %digest, size, "built layer");

        Ok(BuiltLayer {
            digest,
            diff_id,
            size,
            media_type: media_type.to_string(),
        })
    }
}

fn remote_error(url: &Url, err: &dyn std::fmt::Display) -> Error {
    Error::Upstream {
        reference: url.to_string(),
        message: err.to_string(),
        status: None,
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn join_tar_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Recursive walk emitting each descendant file at `destination/<relative>`.
///
/// Children are visited in name order so the resulting tar is stable.
fn walk_dir(dir: &Path, destination: &str, entries: &mut Vec<Entry>) -> Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let path = child.path();
        let child_destination = join_tar_path(destination, &basename(&path));
        let meta = child.metadata()?;
        if meta.is_dir() {
            walk_dir(&path, &child_destination, entries)?;
        } else {
            entries.push(Entry {
                path: child_destination,
                size: meta.len(),
                source: Source::Local(path),
            });
        }
    }
    Ok(())
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Synchronous tar + gzip assembly with digest/diffID computation.
fn assemble(
    entries: &[Entry],
    mode: u32,
    mtime: u64,
    blobs_dir: &Path,
) -> Result<(PathBuf, String, String, i64)> {
    let tmp_path = blobs_dir.join(format!(
        "tmp-layer-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));

    let result = assemble_into(&tmp_path, entries, mode, mtime);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    let (digest, diff_id, size) = result?;
    Ok((tmp_path, digest, diff_id, size))
}

fn assemble_into(
    tmp_path: &Path,
    entries: &[Entry],
    mode: u32,
    mtime: u64,
) -> Result<(String, String, i64)> {
    let file = fs::File::create(tmp_path)?;
    let compressed = HashingWriter::new(file);
    let gz = GzEncoder::new(compressed, Compression::none());
    let uncompressed = HashingWriter::new(gz);
    let mut builder = tar::Builder::new(uncompressed);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(mode);
        header.set_mtime(mtime);
        header.set_size(entry.size);

        // Layer entries are archive-relative.
        let name = entry.path.trim_start_matches('/');

        match &entry.source {
            Source::Bytes(bytes) => {
                if bytes.len() as u64 != entry.size {
                    return Err(Error::SizeMismatch {
                        expected: entry.size as i64,
                        actual: bytes.len() as i64,
                    });
                }
                builder.append_data(&mut header, name, bytes.as_slice())?;
            }
            Source::Local(path) => {
                let source = fs::File::open(path)?;
                let mut reader = ExactReader::new(source, entry.size, &entry.path);
                builder.append_data(&mut header, name, &mut reader)?;
            }
        }
    }

    let uncompressed = builder.into_inner()?;
    let (gz, diff_id, _) = uncompressed.finish();
    let compressed = gz.finish()?;
    let (mut file, digest, size) = compressed.finish();
    file.flush()?;

    Ok((digest, diff_id, size as i64))
}

/// Reads exactly `size` bytes; a source that runs dry early is fatal.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    name: String,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64, name: &str) -> Self {
        Self {
            inner,
            remaining: size,
            name: name.to_string(),
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read for {} ({} bytes missing)", self.name, self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// A writer that hashes and counts everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Unwrap, returning the prefixed digest and byte count.
    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> Store {
        Store::open(&tmp.path().join("cache")).unwrap()
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("").unwrap(), 0o644);
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("0o755").unwrap(), 0o755);
        assert_eq!(parse_mode("420").unwrap(), 420);
        assert!(parse_mode("rw-").is_err());
    }

    #[tokio::test]
    async fn test_expand_file_to_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hello").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = builder
            .expand_file(src.to_str().unwrap(), "/data/hello.txt")
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/data/hello.txt");
        assert_eq!(entries[0].size, 5);
    }

    #[tokio::test]
    async fn test_expand_file_into_directory() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hello").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = builder
            .expand_file(src.to_str().unwrap(), "/data/")
            .await
            .unwrap();

        assert_eq!(entries[0].path, "/data/hello.txt");
    }

    #[tokio::test]
    async fn test_expand_directory_walks_sorted() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let dir = tmp.path().join("tree");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("b.txt"), "b").unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("sub/c.txt"), "c").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = builder
            .expand_file(dir.to_str().unwrap(), "/opt/tree")
            .await
            .unwrap();

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/opt/tree/a.txt", "/opt/tree/b.txt", "/opt/tree/sub/c.txt"]
        );
    }

    #[tokio::test]
    async fn test_expand_missing_source_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let builder = LayerBuilder::new(&store, 0o644);
        let err = builder
            .expand_file("/does/not/exist", "/data/x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_build_commits_content_addressed_blob() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hello").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = builder
            .expand_file(src.to_str().unwrap(), "/data/hello.txt")
            .await
            .unwrap();
        let layer = builder
            .build(entries, media::OCI_LAYER_GZIP)
            .await
            .unwrap();

        let blob = fs::read(store.blob_path(&layer.digest)).unwrap();
        assert_eq!(format!("sha256:{}", sha256_hex(&blob)), layer.digest);
        assert_eq!(blob.len() as i64, layer.size);

        // The diffID names the uncompressed tar stream.
        let mut tar_bytes = Vec::new();
        flate2::read::GzDecoder::new(blob.as_slice())
            .read_to_end(&mut tar_bytes)
            .unwrap();
        assert_eq!(format!("sha256:{}", sha256_hex(&tar_bytes)), layer.diff_id);

        // And the tar holds the entry with the constant mode and mod time.
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "data/hello.txt");
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        assert_eq!(entry.header().mtime().unwrap(), 0);
        assert_eq!(entry.header().size().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_build_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hello").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = builder
            .expand_file(src.to_str().unwrap(), "/data/hello.txt")
            .await
            .unwrap();

        let first = builder
            .build(entries.clone(), media::OCI_LAYER_GZIP)
            .await
            .unwrap();
        let second = builder.build(entries, media::OCI_LAYER_GZIP).await.unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.size, second.size);
    }

    #[tokio::test]
    async fn test_destination_slash_changes_entry_name() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hello").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let plain = builder
            .expand_file(src.to_str().unwrap(), "/data/renamed")
            .await
            .unwrap();
        let in_dir = builder
            .expand_file(src.to_str().unwrap(), "/data/renamed/")
            .await
            .unwrap();

        assert_eq!(plain[0].path, "/data/renamed");
        assert_eq!(in_dir[0].path, "/data/renamed/hello.txt");
    }

    #[tokio::test]
    async fn test_short_read_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let src = tmp.path().join("hello.txt");
        fs::write(&src, "Hi").unwrap();

        let builder = LayerBuilder::new(&store, 0o644);
        let entries = vec![Entry {
            path: "/data/hello.txt".to_string(),
            size: 10,
            source: Source::Local(src),
        }];

        assert!(builder.build(entries, media::OCI_LAYER_GZIP).await.is_err());
        // No temp artifact survives a failed assembly.
        let leftovers = fs::read_dir(store.blobs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(leftovers, 0);
    }
}
