//! Model packaging.
//!
//! A model mutate pulls a model image from the model registry (same wire
//! protocol as any other registry) and lays it out under the image's work
//! directory the way the model runtime expects it on disk:
//!
//! ```text
//! <workDir>/manifests/<name>          raw model manifest
//! <workDir>/blobs/sha256:<hex>        model config, keyed by its hash
//! <workDir>/blobs/<digest>            each model layer
//! ```
//!
//! Layer blobs are staged under `tmp/models/blobs` keyed by digest, so a
//! model shared between images is downloaded once.

use oci_distribution::manifest::OciImageManifest;
use oci_distribution::Reference;

use stratum_core::atomic::sha256_hex;
use stratum_core::config::ModelMutate;
use stratum_core::{Error, Result};

use crate::layer::{Entry, Source};
use crate::rule::{DEFAULT_ARCH, DEFAULT_OS};
use crate::store::Store;
use crate::upstream::{RemoteDescriptor, Upstream};

/// Expands a model mutate into tar entries.
pub struct ModelPacker<'a> {
    upstream: &'a Upstream,
    store: &'a Store,
}

impl<'a> ModelPacker<'a> {
    pub fn new(upstream: &'a Upstream, store: &'a Store) -> Self {
        Self { upstream, store }
    }

    pub async fn expand(&self, mutate: &ModelMutate) -> Result<Vec<Entry>> {
        let reference: Reference = mutate.model.parse().map_err(|e| {
            Error::ConfigInvalid(format!("model reference {:?}: {}", mutate.model, e))
        })?;

        let manifest = self.resolve_manifest(&reference).await?;

        let mut entries = Vec::with_capacity(manifest.layers.len() + 2);

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        entries.push(Entry {
            path: manifest_tar_path(&mutate.work_dir, &mutate.model, mutate.model_name.as_deref()),
            size: manifest_bytes.len() as u64,
            source: Source::Bytes(manifest_bytes),
        });

        let config = self.upstream.pull_config(&reference, &manifest).await?;
        entries.push(Entry {
            path: blob_tar_path(&mutate.work_dir, &format!("sha256:{}", sha256_hex(&config))),
            size: config.len() as u64,
            source: Source::Bytes(config),
        });

        for layer in &manifest.layers {
            let staged = self.store.model_blob_path(&layer.digest);
            self.upstream.stage_blob(&reference, layer, &staged).await?;
            let size = std::fs::metadata(&staged)?.len();
            entries.push(Entry {
                path: blob_tar_path(&mutate.work_dir, &layer.digest),
                size,
                source: Source::Local(staged),
            });
        }

        tracing::info!(
            model = %mutate.model,
            work_dir = %mutate.work_dir,
            files = entries.len(),
            "expanded model"
        );
        Ok(entries)
    }

    /// Fetch the model manifest, resolving an index to its default
    /// platform child.
    async fn resolve_manifest(&self, reference: &Reference) -> Result<OciImageManifest> {
        let index = match self.upstream.get(reference).await? {
            RemoteDescriptor::Image { manifest, .. } => return Ok(manifest),
            RemoteDescriptor::Index { index, .. } => index,
        };

        let child = index
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .map(|p| p.os == DEFAULT_OS && p.architecture == DEFAULT_ARCH)
                    .unwrap_or(false)
            })
            .or_else(|| index.manifests.first())
            .ok_or_else(|| {
                Error::ConfigInvalid(format!("model index {} has no manifests", reference))
            })?;

        let child_ref = Reference::with_digest(
            reference.registry().to_string(),
            reference.repository().to_string(),
            child.digest.clone(),
        );
        match self.upstream.get(&child_ref).await? {
            RemoteDescriptor::Image { manifest, .. } => Ok(manifest),
            RemoteDescriptor::Index { .. } => Err(Error::Internal(format!(
                "model index {} nests another index",
                reference
            ))),
        }
    }
}

/// Tar path of the model manifest: the model name with the first `:`
/// replaced by `/`, under `<workDir>/manifests/`.
fn manifest_tar_path(work_dir: &str, model: &str, model_name: Option<&str>) -> String {
    let name = match model_name {
        Some(name) if !name.is_empty() => name,
        _ => model,
    };
    let name = name.replacen(':', "/", 1);
    format!("{}/manifests/{}", work_dir.trim_end_matches('/'), name)
}

fn blob_tar_path(work_dir: &str, digest: &str) -> String {
    format!("{}/blobs/{}", work_dir.trim_end_matches('/'), digest)
}
