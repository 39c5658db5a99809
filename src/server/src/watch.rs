//! Dynamic rule watching.
//!
//! The orchestration API serves two collection-scoped resources, `images`
//! and `registries`, with the usual list+watch contract: a JSON list
//! carrying a resource version, then a chunked stream of
//! `{"type": ..., "object": ...}` events from that version on. Every
//! add/update/delete is folded into the rule registry, which invalidates
//! its memoized projection. The watcher reconnects with backoff and
//! relists from scratch when the stream breaks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use stratum_core::config::{ImageSpec, RegistrySpec};
use stratum_core::{Error, Result};

use crate::rules::RuleRegistry;

/// Collection path prefix under the API server.
const GROUP_PATH: &str = "apis/stratum.dev/v1alpha1";

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How to reach the orchestration API.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// API server base URL.
    pub server: String,
    /// Bearer token, when required.
    pub token: Option<String>,
    /// Skip TLS verification.
    pub insecure_skip_tls_verify: bool,
}

impl WatchConfig {
    /// Point directly at an API server URL.
    pub fn from_master(url: &str) -> Self {
        Self {
            server: url.trim_end_matches('/').to_string(),
            token: None,
            insecure_skip_tls_verify: false,
        }
    }

    /// Read the subset of a kubeconfig this watcher understands: the
    /// first cluster's server and TLS setting, the first user's token.
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct Kubeconfig {
            #[serde(default)]
            clusters: Vec<NamedCluster>,
            #[serde(default)]
            users: Vec<NamedUser>,
        }
        #[derive(Deserialize)]
        struct NamedCluster {
            cluster: Cluster,
        }
        #[derive(Deserialize)]
        struct Cluster {
            server: String,
            #[serde(default, rename = "insecure-skip-tls-verify")]
            insecure_skip_tls_verify: bool,
        }
        #[derive(Deserialize)]
        struct NamedUser {
            user: User,
        }
        #[derive(Deserialize, Default)]
        struct User {
            #[serde(default)]
            token: Option<String>,
        }

        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("reading kubeconfig {}: {}", path.display(), e))
        })?;
        let parsed: Kubeconfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("parsing kubeconfig: {e}")))?;

        let cluster = parsed
            .clusters
            .first()
            .ok_or_else(|| Error::ConfigInvalid("kubeconfig has no clusters".to_string()))?;

        Ok(Self {
            server: cluster.cluster.server.trim_end_matches('/').to_string(),
            token: parsed.users.first().and_then(|u| u.user.token.clone()),
            insecure_skip_tls_verify: cluster.cluster.insecure_skip_tls_verify,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResourceObject {
    #[serde(default)]
    metadata: ObjectMeta,
    spec: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<ResourceObject>,
    #[serde(default)]
    metadata: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: ResourceObject,
}

#[derive(Debug, Clone, Copy)]
enum Collection {
    Images,
    Registries,
}

impl Collection {
    fn path(self) -> &'static str {
        match self {
            Collection::Images => "images",
            Collection::Registries => "registries",
        }
    }
}

/// Watch both collections forever, folding events into the registry.
pub async fn run(config: WatchConfig, rules: Arc<RuleRegistry>) {
    let client = match build_client(&config) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "building watch client");
            return;
        }
    };

    tokio::join!(
        watch_collection(&client, &config, Collection::Images, &rules),
        watch_collection(&client, &config, Collection::Registries, &rules),
    );
}

fn build_client(config: &WatchConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if config.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(token) = &config.token {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::ConfigInvalid(format!("invalid bearer token: {e}")))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }
    builder
        .build()
        .map_err(|e| Error::Internal(format!("building watch client: {e}")))
}

async fn watch_collection(
    client: &reqwest::Client,
    config: &WatchConfig,
    collection: Collection,
    rules: &Arc<RuleRegistry>,
) {
    loop {
        match list(client, config, collection, rules).await {
            Ok(resource_version) => {
                if let Err(e) = watch_stream(client, config, collection, rules, &resource_version)
                    .await
                {
                    tracing::warn!(
                        collection = collection.path(),
                        error = %e,
                        "watch stream ended"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(collection = collection.path(), error = %e, "listing resources");
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// List the collection, replace the dynamic set, return the resource
/// version to watch from.
async fn list(
    client: &reqwest::Client,
    config: &WatchConfig,
    collection: Collection,
    rules: &Arc<RuleRegistry>,
) -> Result<String> {
    let url = format!("{}/{}/{}", config.server, GROUP_PATH, collection.path());
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| watch_error(&url, e))?;
    if !response.status().is_success() {
        return Err(Error::Upstream {
            reference: url.clone(),
            message: format!("status code {}", response.status().as_u16()),
            status: Some(response.status().as_u16()),
        });
    }

    let body: ResourceList = response.json().await.map_err(|e| watch_error(&url, e))?;

    match collection {
        Collection::Images => {
            rules.set_images(specs_by_name(collection, body.items));
        }
        Collection::Registries => {
            rules.set_registries(specs_by_name(collection, body.items));
        }
    }

    Ok(body.metadata.resource_version)
}

async fn watch_stream(
    client: &reqwest::Client,
    config: &WatchConfig,
    collection: Collection,
    rules: &Arc<RuleRegistry>,
    resource_version: &str,
) -> Result<()> {
    let url = format!(
        "{}/{}/{}?watch=true&resourceVersion={}",
        config.server,
        GROUP_PATH,
        collection.path(),
        resource_version,
    );
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| watch_error(&url, e))?;
    if !response.status().is_success() {
        return Err(Error::Upstream {
            reference: url.clone(),
            message: format!("status code {}", response.status().as_u16()),
            status: Some(response.status().as_u16()),
        });
    }

    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| watch_error(&url, e))?;
        buffer.extend_from_slice(&chunk);

        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<WatchEvent>(line) {
                Ok(event) => apply_event(collection, rules, event),
                Err(e) => {
                    tracing::warn!(
                        collection = collection.path(),
                        error = %e,
                        "skipping undecodable watch event"
                    );
                }
            }
        }
    }

    Ok(())
}

fn apply_event(collection: Collection, rules: &Arc<RuleRegistry>, event: WatchEvent) {
    let name = event.object.metadata.name.clone();
    tracing::debug!(
        collection = collection.path(),
        resource = %name,
        event = %event.kind,
        version = %event.object.metadata.resource_version,
        "watch event"
    );

    match (collection, event.kind.as_str()) {
        (Collection::Images, "ADDED" | "MODIFIED") => {
            if let Some(spec) = decode_spec::<ImageSpec>(collection, &name, event.object.spec) {
                rules.upsert_image(name, spec);
            }
        }
        (Collection::Images, "DELETED") => rules.delete_image(&name),
        (Collection::Registries, "ADDED" | "MODIFIED") => {
            if let Some(spec) = decode_spec::<RegistrySpec>(collection, &name, event.object.spec) {
                rules.upsert_registry(name, spec);
            }
        }
        (Collection::Registries, "DELETED") => rules.delete_registry(&name),
        (_, other) => {
            tracing::debug!(event = other, "ignoring watch event type");
        }
    }
}

fn specs_by_name<T: DeserializeOwned>(
    collection: Collection,
    items: Vec<ResourceObject>,
) -> BTreeMap<String, T> {
    let mut map = BTreeMap::new();
    for item in items {
        let name = item.metadata.name.clone();
        if let Some(spec) = decode_spec(collection, &name, item.spec) {
            map.insert(name, spec);
        }
    }
    map
}

fn decode_spec<T: DeserializeOwned>(
    collection: Collection,
    name: &str,
    spec: serde_json::Value,
) -> Option<T> {
    match serde_json::from_value(spec) {
        Ok(spec) => Some(spec),
        Err(e) => {
            tracing::error!(
                collection = collection.path(),
                resource = %name,
                error = %e,
                "skipping undecodable resource"
            );
            None
        }
    }
}

fn watch_error(url: &str, err: impl std::fmt::Display) -> Error {
    Error::Upstream {
        reference: url.to_string(),
        message: err.to_string(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<RuleRegistry> {
        Arc::new(RuleRegistry::new(vec![]).unwrap())
    }

    fn event(kind: &str, name: &str, spec: serde_json::Value) -> WatchEvent {
        serde_json::from_value(json!({
            "type": kind,
            "object": {
                "apiVersion": "stratum.dev/v1alpha1",
                "kind": "Image",
                "metadata": {"name": name, "resourceVersion": "7"},
                "spec": spec,
            },
        }))
        .unwrap()
    }

    #[test]
    fn test_image_events_drive_rules() {
        let rules = registry();

        apply_event(
            Collection::Images,
            &rules,
            event(
                "ADDED",
                "demo",
                json!({"match": "demo:{tag}", "baseImage": "alpine:{tag}"}),
            ),
        );
        assert!(rules.resolve("demo:3.20").is_some());

        apply_event(
            Collection::Images,
            &rules,
            event(
                "MODIFIED",
                "demo",
                json!({"match": "other:{tag}", "baseImage": "alpine:{tag}"}),
            ),
        );
        assert!(rules.resolve("demo:3.20").is_none());
        assert!(rules.resolve("other:3.20").is_some());

        apply_event(Collection::Images, &rules, event("DELETED", "demo", json!({})));
        assert!(rules.resolve("other:3.20").is_none());
    }

    #[test]
    fn test_registry_events_drive_credentials() {
        let rules = registry();

        apply_event(
            Collection::Registries,
            &rules,
            event(
                "ADDED",
                "internal",
                json!({"endpoint": "registry.internal:5000", "insecure": true}),
            ),
        );
        assert!(rules
            .credentials_for("registry.internal:5000")
            .unwrap()
            .insecure);
    }

    #[test]
    fn test_undecodable_spec_is_skipped() {
        let rules = registry();
        apply_event(
            Collection::Images,
            &rules,
            event("ADDED", "broken", json!({"match": 42})),
        );
        assert!(rules.snapshot().is_empty());
    }

    #[test]
    fn test_kubeconfig_parsing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kubeconfig");
        std::fs::write(
            &path,
            r#"
apiVersion: v1
clusters:
  - name: default
    cluster:
      server: https://orchestrator.internal:6443/
      insecure-skip-tls-verify: true
users:
  - name: default
    user:
      token: secret-token
"#,
        )
        .unwrap();

        let config = WatchConfig::from_kubeconfig(&path).unwrap();
        assert_eq!(config.server, "https://orchestrator.internal:6443");
        assert_eq!(config.token.as_deref(), Some("secret-token"));
        assert!(config.insecure_skip_tls_verify);
    }
}
