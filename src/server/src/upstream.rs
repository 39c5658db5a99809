//! Upstream registry client.
//!
//! Pulls descriptors, configs, and layers from remote registries (and the
//! model registry, which speaks the same protocol). Credentials are
//! resolved per registry host through the rule registry's registry map;
//! hosts marked insecure are reached over plain HTTP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{OciDescriptor, OciImageIndex, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use stratum_core::{Error, Result};

use crate::media;
use crate::rules::RuleRegistry;
use crate::store::Store;

/// The result of fetching a reference's descriptor.
pub enum RemoteDescriptor {
    /// A single-platform image manifest.
    Image {
        manifest: OciImageManifest,
        digest: String,
        media_type: String,
    },
    /// A multi-platform index.
    Index {
        index: OciImageIndex,
        digest: String,
        media_type: String,
    },
}

/// A per-host client plus the transport setting it was built with, so a
/// changed Registry resource rebuilds it.
struct CachedClient {
    insecure: bool,
    client: Arc<Client>,
}

/// Pulls from remote registries with per-host credentials.
///
/// One client is kept per registry host and reused across calls: the
/// crate caches the bearer token from an authenticated exchange on the
/// client instance, and blob pulls only succeed on the instance that
/// holds the token.
pub struct Upstream {
    rules: Arc<RuleRegistry>,
    clients: Mutex<HashMap<String, CachedClient>>,
}

impl Upstream {
    pub fn new(rules: Arc<RuleRegistry>) -> Self {
        Self {
            rules,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The cached client and auth for the reference's registry host.
    pub fn client_and_auth(&self, reference: &Reference) -> (Arc<Client>, RegistryAuth) {
        let host = reference.registry().to_string();
        let credentials = self.rules.credentials_for(&host);
        let insecure = credentials.as_ref().map(|c| c.insecure).unwrap_or(false);

        let client = {
            let mut clients = self.clients.lock().unwrap();
            match clients.get(&host) {
                Some(cached) if cached.insecure == insecure => Arc::clone(&cached.client),
                _ => {
                    let protocol = if insecure {
                        // The protocol exception list is matched against
                        // the host the client actually connects to.
                        ClientProtocol::HttpsExcept(vec![reference.resolve_registry().to_string()])
                    } else {
                        ClientProtocol::Https
                    };
                    let client = Arc::new(Client::new(ClientConfig {
                        protocol,
                        ..Default::default()
                    }));
                    clients.insert(
                        host,
                        CachedClient {
                            insecure,
                            client: Arc::clone(&client),
                        },
                    );
                    client
                }
            }
        };

        let auth = match credentials {
            Some(c) => match (c.username, c.password) {
                (Some(username), Some(password)) => RegistryAuth::Basic(username, password),
                _ => RegistryAuth::Anonymous,
            },
            None => RegistryAuth::Anonymous,
        };

        (client, auth)
    }

    /// The host's client with a pull token established for `reference`.
    async fn authenticated_client(&self, reference: &Reference) -> Result<Arc<Client>> {
        let (client, auth) = self.client_and_auth(reference);
        client
            .auth(reference, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| upstream_error(reference, e))?;
        Ok(client)
    }

    /// Fetch the manifest or index a reference points at.
    pub async fn get(&self, reference: &Reference) -> Result<RemoteDescriptor> {
        let (client, auth) = self.client_and_auth(reference);
        let (manifest, digest) = client
            .pull_manifest(reference, &auth)
            .await
            .map_err(|e| upstream_error(reference, e))?;

        Ok(match manifest {
            OciManifest::Image(manifest) => RemoteDescriptor::Image {
                media_type: manifest
                    .media_type
                    .clone()
                    .unwrap_or_else(|| media::OCI_MANIFEST.to_string()),
                manifest,
                digest,
            },
            OciManifest::ImageIndex(index) => RemoteDescriptor::Index {
                media_type: index
                    .media_type
                    .clone()
                    .unwrap_or_else(|| media::OCI_INDEX.to_string()),
                index,
                digest,
            },
        })
    }

    /// HEAD-equivalent existence probe; returns the manifest digest.
    pub async fn head(&self, reference: &Reference) -> Result<String> {
        let (client, auth) = self.client_and_auth(reference);
        client
            .fetch_manifest_digest(reference, &auth)
            .await
            .map_err(|e| upstream_error(reference, e))
    }

    /// Pull an image's raw config bytes.
    pub async fn pull_config(
        &self,
        reference: &Reference,
        manifest: &OciImageManifest,
    ) -> Result<Vec<u8>> {
        let client = self.authenticated_client(reference).await?;
        let mut config = Vec::new();
        client
            .pull_blob(reference, &manifest.config, &mut config)
            .await
            .map_err(|e| upstream_error(reference, e))?;
        Ok(config)
    }

    /// Stream a compressed layer into the content-addressed store,
    /// verifying digest and size. Already-present blobs are skipped.
    pub async fn save_layer(
        &self,
        reference: &Reference,
        layer: &OciDescriptor,
        store: &Store,
    ) -> Result<()> {
        if layer.size <= 0 {
            return Err(Error::ConfigInvalid(format!(
                "zero-size layer {}",
                layer.digest
            )));
        }

        if store.has_blob(&layer.digest) {
            tracing::debug!(digest = %layer.digest, size = layer.size, "skip layer");
            return Ok(());
        }

        let target = store.blob_path(&layer.digest);
        self.pull_verified(reference, layer, &target).await?;
        tracing::info!(digest = %layer.digest, size = layer.size, "save layer");
        Ok(())
    }

    /// Stage a verified blob at an arbitrary path (model blobs). Skipped
    /// when the file already exists.
    pub async fn stage_blob(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
        target: &Path,
    ) -> Result<()> {
        if target.is_file() {
            return Ok(());
        }
        self.pull_verified(reference, descriptor, target).await
    }

    async fn pull_verified(
        &self,
        reference: &Reference,
        descriptor: &OciDescriptor,
        target: &Path,
    ) -> Result<()> {
        let client = self.authenticated_client(reference).await?;
        let mut sink = BlobSink::create(target).await?;
        if let Err(e) = client.pull_blob(reference, descriptor, &mut sink).await {
            sink.abort().await;
            return Err(upstream_error(reference, e));
        }
        sink.commit(&descriptor.digest, descriptor.size).await
    }
}

fn upstream_error(reference: &Reference, err: OciDistributionError) -> Error {
    let status = match &err {
        OciDistributionError::ServerError { code, .. } => Some(*code),
        _ => None,
    };
    Error::Upstream {
        reference: reference.whole(),
        message: err.to_string(),
        status,
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An async temp-file writer that hashes what it writes and only renames
/// into place when the digest and size check out.
pub(crate) struct BlobSink {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    target: PathBuf,
    hasher: Sha256,
    written: i64,
    done: bool,
}

impl BlobSink {
    pub(crate) async fn create(target: &Path) -> Result<Self> {
        let dir = target.parent().ok_or_else(|| {
            Error::Internal(format!("no parent directory for {}", target.display()))
        })?;
        tokio::fs::create_dir_all(dir).await?;

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
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Self {
            file: Some(file),
            tmp_path,
            target: target.to_path_buf(),
            hasher: Sha256::new(),
            written: 0,
            done: false,
        })
    }

    /// Verify the digest and size, then rename into place. On mismatch the
    /// temp file is removed and the blob never becomes visible.
    pub(crate) async fn commit(mut self, expected_digest: &str, expected_size: i64) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.done = true;

        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        let expected_hex = expected_digest.trim_start_matches("sha256:");

        if actual != expected_hex {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(Error::DigestMismatch {
                expected: expected_digest.to_string(),
                actual: format!("sha256:{actual}"),
            });
        }
        if self.written != expected_size {
            let _ = tokio::fs::remove_file(&self.tmp_path).await;
            return Err(Error::SizeMismatch {
                expected: expected_size,
                actual: self.written,
            });
        }

        tokio::fs::rename(&self.tmp_path, &self.target).await?;
        Ok(())
    }

    pub(crate) async fn abort(mut self) {
        self.file.take();
        self.done = true;
        let _ = tokio::fs::remove_file(&self.tmp_path).await;
    }
}

impl Drop for BlobSink {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

impl AsyncWrite for BlobSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let file = match this.file.as_mut() {
            Some(file) => file,
            None => {
                return Poll::Ready(Err(std::io::Error::other("blob sink already closed")));
            }
        };
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as i64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
