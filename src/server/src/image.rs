//! Image and index mutation.
//!
//! The builder takes a resolved action, pulls the declared base image,
//! appends one layer per mutate, and persists every produced blob into
//! the content-addressed store before installing the named tag pointer.
//! Multi-platform bases are mutated per child with the index rebuilt from
//! the fresh child manifests.
//!
//! The base config is edited as a JSON value so fields this server does
//! not model survive the rewrite untouched.

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt};
use oci_distribution::manifest::{OciImageIndex, OciImageManifest};
use oci_distribution::Reference;
use serde_json::{json, Value};

use stratum_core::config::Mutate;
use stratum_core::{Error, Result};

use crate::layer::{parse_mode, BuiltLayer, LayerBuilder, DEFAULT_MODE};
use crate::links::{self, LinkRecord};
use crate::media;
use crate::model::ModelPacker;
use crate::rule::Action;
use crate::store::Store;
use crate::upstream::{RemoteDescriptor, Upstream};

/// Author recorded in the history of appended layers.
pub const HISTORY_AUTHOR: &str = "stratum";

/// Deterministic creation time for appended history entries.
const EPOCH: &str = "1970-01-01T00:00:00Z";

/// Children of an index are mutated with this much parallelism.
const CHILD_CONCURRENCY: usize = 2;

/// A freshly produced (but unnamed) manifest.
struct MutatedImage {
    bytes: Vec<u8>,
    digest: String,
    size: i64,
    media_type: String,
}

/// Builds images on demand and persists them into the store.
pub struct ImageBuilder {
    store: Arc<Store>,
    upstream: Arc<Upstream>,
}

impl ImageBuilder {
    pub fn new(store: Arc<Store>, upstream: Arc<Upstream>) -> Self {
        Self { store, upstream }
    }

    /// Build the target reference according to the action and install the
    /// tag pointer. Every referenced blob is on disk before the pointer
    /// appears.
    pub async fn build(&self, target: &str, action: &Action) -> Result<()> {
        let target = stratum_core::reference::Reference::parse(target)?;

        let base = action.base_image();
        let base_ref: Reference = base
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("base image {base:?}: {e}")))?;

        tracing::info!(reference = %target, base = %base_ref, "building image");

        let manifest_bytes = match self.upstream.get(&base_ref).await? {
            RemoteDescriptor::Image {
                manifest,
                media_type,
                ..
            } => {
                self.mutate_image(&base_ref, manifest, &media_type, None, action)
                    .await?
                    .bytes
            }
            RemoteDescriptor::Index { index, .. } => {
                self.mutate_index(&base_ref, index, action).await?
            }
        };

        self.store
            .write_tag(&target.repository, target.identifier(), &manifest_bytes)
    }

    /// Mutate every admitted child of an index and rebuild it.
    async fn mutate_index(
        &self,
        base_ref: &Reference,
        mut index: OciImageIndex,
        action: &Action,
    ) -> Result<Vec<u8>> {
        // Children without a platform are skipped; the rest go through
        // the rule's platform filter.
        let children: Vec<_> = index
            .manifests
            .iter()
            .filter(|child| match &child.platform {
                Some(p) => action.rule().allows_platform(&p.os, &p.architecture),
                None => false,
            })
            .cloned()
            .collect();

        if children.is_empty() {
            return Err(Error::NoValidChildren);
        }

        let registry = base_ref.registry().to_string();
        let repository = base_ref.repository().to_string();

        let mutated: Vec<_> = futures_util::stream::iter(children.into_iter().map(|child| {
            let registry = registry.clone();
            let repository = repository.clone();
            async move {
                let platform = child.platform.clone().ok_or_else(|| {
                    Error::Internal("platform-less child survived filtering".to_string())
                })?;
                let child_ref =
                    Reference::with_digest(registry, repository, child.digest.clone());

                let (manifest, media_type) = match self.upstream.get(&child_ref).await? {
                    RemoteDescriptor::Image {
                        manifest,
                        media_type,
                        ..
                    } => (manifest, media_type),
                    RemoteDescriptor::Index { .. } => {
                        return Err(Error::Internal(format!(
                            "index child {} is itself an index",
                            child.digest
                        )));
                    }
                };

                let image = self
                    .mutate_image(
                        &child_ref,
                        manifest,
                        &media_type,
                        Some((platform.os.as_str(), platform.architecture.as_str())),
                        action,
                    )
                    .await?;
                Ok::<_, Error>((child, image))
            }
        }))
        .buffered(CHILD_CONCURRENCY)
        .try_collect()
        .await?;

        index.manifests = mutated
            .into_iter()
            .map(|(mut child, image)| {
                child.digest = image.digest;
                child.size = image.size;
                child.media_type = image.media_type;
                child
            })
            .collect();

        let bytes = serde_json::to_vec(&index)?;
        self.store.put_blob(&bytes)?;
        Ok(bytes)
    }

    /// Apply the action's mutates to one single-platform image.
    async fn mutate_image(
        &self,
        base_ref: &Reference,
        mut manifest: OciImageManifest,
        manifest_media_type: &str,
        platform: Option<(&str, &str)>,
        action: &Action,
    ) -> Result<MutatedImage> {
        let layer_media_type = media::layer_media_type(manifest_media_type).ok_or_else(|| {
            Error::ConfigInvalid(format!("unknown media type {manifest_media_type:?}"))
        })?;

        // Base layers first: the finished manifest must never reference a
        // blob that is not on disk.
        for layer in &manifest.layers {
            self.upstream.save_layer(base_ref, layer, &self.store).await?;
        }

        let config_bytes = self.upstream.pull_config(base_ref, &manifest).await?;
        let mut config: Value = serde_json::from_slice(&config_bytes)?;

        for mutate in action.mutates(platform) {
            let (layer, history) = self.build_addendum(&mutate, layer_media_type).await?;
            append_layer_to_config(&mut config, &layer, history)?;

            let mut descriptor = manifest.config.clone();
            descriptor.media_type = layer.media_type.clone();
            descriptor.digest = layer.digest.clone();
            descriptor.size = layer.size;
            descriptor.urls = None;
            descriptor.annotations = None;
            manifest.layers.push(descriptor);
        }

        let new_config = serde_json::to_vec(&config)?;
        manifest.config.digest = self.store.put_blob(&new_config)?;
        manifest.config.size = new_config.len() as i64;

        let bytes = serde_json::to_vec(&manifest)?;
        let digest = self.store.put_blob(&bytes)?;

        Ok(MutatedImage {
            size: bytes.len() as i64,
            digest,
            bytes,
            media_type: manifest_media_type.to_string(),
        })
    }

    /// Build (or reuse via the link cache) the layer for one mutate.
    async fn build_addendum(
        &self,
        mutate: &Mutate,
        layer_media_type: &str,
    ) -> Result<(BuiltLayer, Value)> {
        match mutate {
            Mutate::File(file) => {
                let link_path = self.store.link_path(
                    &file.destination,
                    &links::file_input_hash(&file.source, &file.destination, &file.mode),
                );

                let layer = match self.cached_layer(&link_path, layer_media_type) {
                    Some(layer) => layer,
                    None => {
                        let builder = LayerBuilder::new(&self.store, parse_mode(&file.mode)?);
                        let entries = builder
                            .expand_file(&file.source, &file.destination)
                            .await?;
                        let layer = builder.build(entries, layer_media_type).await?;
                        links::write(&link_path, &record(&layer));
                        layer
                    }
                };

                let history = history_entry(
                    format!("COPY {} {}", file.source, file.destination),
                    format!("Copy {} to {}", file.source, file.destination),
                );
                Ok((layer, history))
            }
            Mutate::Model(model) => {
                let link_path = self.store.link_path(
                    &model.work_dir,
                    &links::model_input_hash(&model.model, &model.work_dir),
                );

                let layer = match self.cached_layer(&link_path, layer_media_type) {
                    Some(layer) => layer,
                    None => {
                        let entries = ModelPacker::new(&self.upstream, &self.store)
                            .expand(model)
                            .await?;
                        let builder = LayerBuilder::new(&self.store, DEFAULT_MODE);
                        let layer = builder.build(entries, layer_media_type).await?;
                        links::write(&link_path, &record(&layer));
                        layer
                    }
                };

                let history = history_entry(
                    format!("MODEL_PULL {} {}", model.model, model.work_dir),
                    format!("Pull {} to {}", model.model, model.work_dir),
                );
                Ok((layer, history))
            }
        }
    }

    /// A usable link record: it parses and its blob is still on disk.
    fn cached_layer(&self, link_path: &std::path::Path, media_type: &str) -> Option<BuiltLayer> {
        let rec = links::read(link_path)?;
        if !self.store.has_blob(&rec.digest) {
            return None;
        }
        tracing::debug!(link = %link_path.display(), digest = %rec.digest, "link cache hit");
        Some(BuiltLayer {
            digest: rec.digest,
            diff_id: rec.diff_id,
            size: rec.size,
            media_type: media_type.to_string(),
        })
    }
}

fn record(layer: &BuiltLayer) -> LinkRecord {
    LinkRecord {
        digest: layer.digest.clone(),
        diff_id: layer.diff_id.clone(),
        size: layer.size,
    }
}

fn history_entry(created_by: String, comment: String) -> Value {
    json!({
        "created": EPOCH,
        "created_by": created_by,
        "author": HISTORY_AUTHOR,
        "comment": comment,
    })
}

/// Extend `rootfs.diff_ids` and `history` for one appended layer, leaving
/// every other config field untouched.
fn append_layer_to_config(config: &mut Value, layer: &BuiltLayer, history: Value) -> Result<()> {
    let diff_ids = config
        .pointer_mut("/rootfs/diff_ids")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::Internal("config missing rootfs.diff_ids".to_string()))?;
    diff_ids.push(Value::String(layer.diff_id.clone()));

    let object = config
        .as_object_mut()
        .ok_or_else(|| Error::Internal("config is not an object".to_string()))?;
    object
        .entry("history")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| Error::Internal("config history is not an array".to_string()))?
        .push(history);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleRegistry;
    use stratum_core::config::FileMutate;
    use tempfile::TempDir;

    fn builder(tmp: &TempDir) -> ImageBuilder {
        let store = Arc::new(Store::open(&tmp.path().join("cache")).unwrap());
        let rules = Arc::new(RuleRegistry::new(vec![]).unwrap());
        ImageBuilder::new(store, Arc::new(Upstream::new(rules)))
    }

    fn sample_layer() -> BuiltLayer {
        BuiltLayer {
            digest: format!("sha256:{}", "a".repeat(64)),
            diff_id: format!("sha256:{}", "b".repeat(64)),
            size: 42,
            media_type: media::OCI_LAYER_GZIP.to_string(),
        }
    }

    #[test]
    fn test_append_layer_to_config() {
        let mut config = json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/usr/bin"], "Cmd": ["/bin/sh"]},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:base"]},
            "history": [{"created": "2024-01-01T00:00:00Z", "created_by": "/bin/sh -c base"}],
            "unmodeled": {"kept": true},
        });

        let layer = sample_layer();
        append_layer_to_config(
            &mut config,
            &layer,
            history_entry("COPY a b".to_string(), "Copy a to b".to_string()),
        )
        .unwrap();

        let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
        assert_eq!(diff_ids.len(), 2);
        assert_eq!(diff_ids[1], json!(layer.diff_id));

        let history = config["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["author"], json!(HISTORY_AUTHOR));
        assert_eq!(history[1]["created_by"], json!("COPY a b"));
        assert_eq!(history[1]["created"], json!(EPOCH));

        // Fields the server does not model survive.
        assert_eq!(config["unmodeled"]["kept"], json!(true));
        assert_eq!(config["config"]["Cmd"], json!(["/bin/sh"]));
    }

    #[test]
    fn test_append_layer_creates_history_array() {
        let mut config = json!({
            "rootfs": {"type": "layers", "diff_ids": []},
        });
        append_layer_to_config(
            &mut config,
            &sample_layer(),
            history_entry("COPY a b".to_string(), "Copy a to b".to_string()),
        )
        .unwrap();
        assert_eq!(config["history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_append_layer_rejects_malformed_config() {
        let mut config = json!({"rootfs": {"type": "layers"}});
        let err = append_layer_to_config(
            &mut config,
            &sample_layer(),
            history_entry(String::new(), String::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_build_addendum_reuses_link_record() {
        let tmp = TempDir::new().unwrap();
        let builder = builder(&tmp);

        let source = tmp.path().join("hello.txt");
        std::fs::write(&source, "Hello").unwrap();

        let mutate = Mutate::File(FileMutate {
            source: source.to_str().unwrap().to_string(),
            destination: "/data/hello.txt".to_string(),
            mode: "0644".to_string(),
        });

        let (first, history) = builder
            .build_addendum(&mutate, media::OCI_LAYER_GZIP)
            .await
            .unwrap();
        assert_eq!(history["author"], json!(HISTORY_AUTHOR));

        // Change the source bytes; with the link record intact the second
        // build must reuse the recorded layer rather than re-assembling.
        std::fs::write(&source, "Changed").unwrap();
        let (second, _) = builder
            .build_addendum(&mutate, media::OCI_LAYER_GZIP)
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.size, second.size);
    }

    #[tokio::test]
    async fn test_build_addendum_rebuilds_when_blob_missing() {
        let tmp = TempDir::new().unwrap();
        let builder = builder(&tmp);

        let source = tmp.path().join("hello.txt");
        std::fs::write(&source, "Hello").unwrap();

        let mutate = Mutate::File(FileMutate {
            source: source.to_str().unwrap().to_string(),
            destination: "/data/hello.txt".to_string(),
            mode: "0644".to_string(),
        });

        let (first, _) = builder
            .build_addendum(&mutate, media::OCI_LAYER_GZIP)
            .await
            .unwrap();

        // A link record whose blob vanished is ignored.
        std::fs::remove_file(builder.store.blob_path(&first.digest)).unwrap();
        let (second, _) = builder
            .build_addendum(&mutate, media::OCI_LAYER_GZIP)
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert!(builder.store.has_blob(&second.digest));
    }

    #[tokio::test]
    async fn test_index_with_no_admitted_children_fails() {
        let tmp = TempDir::new().unwrap();
        let builder = builder(&tmp);

        // The rule only admits linux/amd64; the index offers linux/arm64
        // and one platform-less child.
        let spec = stratum_core::config::ImageSpec {
            pattern: "demo:{tag}".to_string(),
            base_image: "alpine:{tag}".to_string(),
            mutates: vec![],
            storage_image: None,
            platforms: Some(vec![stratum_core::config::PlatformSelector {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
            }]),
        };
        let rule = Arc::new(crate::rule::Rule::new(&spec).unwrap());
        let action = rule.matches("demo:3.20").unwrap();

        let index: OciImageIndex = serde_json::from_value(json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_INDEX,
            "manifests": [
                {
                    "mediaType": media::OCI_MANIFEST,
                    "digest": format!("sha256:{}", "c".repeat(64)),
                    "size": 428,
                    "platform": {"os": "linux", "architecture": "arm64"},
                },
                {
                    "mediaType": media::OCI_MANIFEST,
                    "digest": format!("sha256:{}", "d".repeat(64)),
                    "size": 428,
                },
            ],
        }))
        .unwrap();

        let base_ref: Reference = "alpine:3.20".parse().unwrap();
        let err = builder
            .mutate_index(&base_ref, index, &action)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoValidChildren));
    }

    #[tokio::test]
    async fn test_build_addendum_rejects_bad_mode() {
        let tmp = TempDir::new().unwrap();
        let builder = builder(&tmp);

        let mutate = Mutate::File(FileMutate {
            source: "/irrelevant".to_string(),
            destination: "/data/x".to_string(),
            mode: "rwx".to_string(),
        });
        let err = builder
            .build_addendum(&mutate, media::OCI_LAYER_GZIP)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }
}
