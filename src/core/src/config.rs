//! Configuration schema and loader.
//!
//! Configuration is a stream of YAML/JSON documents, each carrying
//! `apiVersion` and `kind`. Two kinds exist: `Image` declares a build
//! rule, `Registry` declares upstream credentials for a registry host.
//! The same schema is served by the orchestration API for dynamically
//! watched rules.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// API version accepted in configuration documents.
pub const API_VERSION: &str = "stratum.dev/v1alpha1";
/// Kind of an image rule document.
pub const IMAGE_KIND: &str = "Image";
/// Kind of a registry credentials document.
pub const REGISTRY_KIND: &str = "Registry";

/// Declares how requests matching a templated reference are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Templated reference pattern, e.g. `example.com/demo:{tag}`.
    #[serde(rename = "match")]
    pub pattern: String,

    /// Templated base image reference, e.g. `alpine:{tag}`.
    pub base_image: String,

    /// Ordered content-producing mutations applied on top of the base.
    #[serde(default)]
    pub mutates: Vec<Mutate>,

    /// When set, built images are pushed here and clients are redirected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_image: Option<String>,

    /// Allowed platforms when the base image is a multi-platform index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<PlatformSelector>>,
}

/// One content-producing mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutate {
    /// Copy a local path or HTTP(S) URL into the image.
    File(FileMutate),
    /// Package a model from a remote model registry into the image.
    Model(ModelMutate),
}

/// Copy `source` (local file, directory, or HTTP(S) URL) to `destination`.
///
/// A trailing `/` on `destination` places the file under that directory
/// using the basename of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMutate {
    pub source: String,
    pub destination: String,
    /// Octal file mode string, e.g. `"0644"`. Empty means the default.
    #[serde(default)]
    pub mode: String,
}

/// Package a model image under `workDir` in the model runtime's layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMutate {
    /// Model reference in the model registry, e.g.
    /// `registry.ollama.ai/library/llama3:8b`.
    pub model: String,
    /// Directory inside the image receiving the model layout.
    pub work_dir: String,
    /// Name the model manifest is filed under; defaults to `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// One allowed OS/architecture pair for index filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSelector {
    pub os: String,
    pub architecture: String,
}

/// Upstream registry endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry endpoint, either a bare host or a `scheme://host` URL.
    pub endpoint: String,

    /// Use plain HTTP when talking to this registry.
    #[serde(default)]
    pub insecure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
}

impl RegistrySpec {
    /// The registry host this spec applies to, with any scheme and path
    /// stripped from the endpoint.
    pub fn host(&self) -> String {
        let s = self
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        match s.find('/') {
            Some(idx) => s[..idx].to_string(),
            None => s.to_string(),
        }
    }

    /// Basic auth credentials, when configured.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        self.authentication
            .as_ref()
            .and_then(|a| a.basic_auth.as_ref())
            .map(|b| (b.username.as_str(), b.password.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A parsed configuration document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Image { name: String, spec: ImageSpec },
    Registry { name: String, spec: RegistrySpec },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    api_version: String,
    kind: String,
    #[serde(default)]
    metadata: Metadata,
    spec: serde_yaml::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
}

/// Parse a stream of YAML/JSON documents.
///
/// Empty documents are skipped; an unexpected `apiVersion` or `kind` is a
/// configuration error.
pub fn load_documents(input: &str) -> Result<Vec<Document>> {
    let mut documents = Vec::new();

    for de in serde_yaml::Deserializer::from_str(input) {
        let value = serde_yaml::Value::deserialize(de)?;
        if value.is_null() {
            continue;
        }

        let raw: RawDocument = serde_yaml::from_value(value)?;
        if raw.api_version != API_VERSION {
            return Err(Error::ConfigInvalid(format!(
                "unexpected apiVersion {:?}",
                raw.api_version
            )));
        }

        match raw.kind.as_str() {
            IMAGE_KIND => documents.push(Document::Image {
                name: raw.metadata.name,
                spec: from_spec(raw.spec)?,
            }),
            REGISTRY_KIND => documents.push(Document::Registry {
                name: raw.metadata.name,
                spec: from_spec(raw.spec)?,
            }),
            other => {
                return Err(Error::ConfigInvalid(format!("unexpected kind {:?}", other)));
            }
        }
    }

    Ok(documents)
}

/// Load and concatenate documents from configuration files.
pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("reading config {}: {}", path.display(), e))
        })?;
        documents.extend(load_documents(&input).map_err(|e| {
            Error::ConfigInvalid(format!("parsing config {}: {}", path.display(), e))
        })?);
    }
    Ok(documents)
}

fn from_spec<T: DeserializeOwned>(value: serde_yaml::Value) -> Result<T> {
    serde_yaml::from_value(value).map_err(|e| Error::ConfigInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: stratum.dev/v1alpha1
kind: Image
metadata:
  name: demo
spec:
  match: "example.com/demo:{tag}"
  baseImage: "alpine:{tag}"
  mutates:
    - file:
        source: ./hello.txt
        destination: /data/hello.txt
        mode: "0644"
---
apiVersion: stratum.dev/v1alpha1
kind: Registry
metadata:
  name: internal
spec:
  endpoint: https://registry.internal:5000
  insecure: false
  authentication:
    basicAuth:
      username: ci
      password: hunter2
"#;

    #[test]
    fn test_load_documents() {
        let docs = load_documents(SAMPLE).unwrap();
        assert_eq!(docs.len(), 2);

        match &docs[0] {
            Document::Image { name, spec } => {
                assert_eq!(name, "demo");
                assert_eq!(spec.pattern, "example.com/demo:{tag}");
                assert_eq!(spec.base_image, "alpine:{tag}");
                assert_eq!(spec.mutates.len(), 1);
                match &spec.mutates[0] {
                    Mutate::File(f) => {
                        assert_eq!(f.source, "./hello.txt");
                        assert_eq!(f.destination, "/data/hello.txt");
                        assert_eq!(f.mode, "0644");
                    }
                    other => panic!("expected file mutate, got {:?}", other),
                }
            }
            other => panic!("expected image document, got {:?}", other),
        }

        match &docs[1] {
            Document::Registry { name, spec } => {
                assert_eq!(name, "internal");
                assert_eq!(spec.host(), "registry.internal:5000");
                assert_eq!(spec.basic_auth(), Some(("ci", "hunter2")));
            }
            other => panic!("expected registry document, got {:?}", other),
        }
    }

    #[test]
    fn test_load_documents_skips_empty() {
        let docs = load_documents("---\n---\n").unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_load_documents_model_mutate() {
        let input = r#"
apiVersion: stratum.dev/v1alpha1
kind: Image
spec:
  match: "models/{name}:{tag}"
  baseImage: "ollama/ollama:latest"
  mutates:
    - model:
        model: "registry.ollama.ai/library/{name}:{tag}"
        workDir: /root/.ollama
        modelName: "{name}:{tag}"
"#;
        let docs = load_documents(input).unwrap();
        match &docs[0] {
            Document::Image { spec, .. } => match &spec.mutates[0] {
                Mutate::Model(m) => {
                    assert_eq!(m.model, "registry.ollama.ai/library/{name}:{tag}");
                    assert_eq!(m.work_dir, "/root/.ollama");
                    assert_eq!(m.model_name.as_deref(), Some("{name}:{tag}"));
                }
                other => panic!("expected model mutate, got {:?}", other),
            },
            other => panic!("expected image document, got {:?}", other),
        }
    }

    #[test]
    fn test_load_documents_rejects_wrong_api_version() {
        let input = "apiVersion: v1\nkind: Image\nspec:\n  match: a\n  baseImage: b\n";
        assert!(load_documents(input).is_err());
    }

    #[test]
    fn test_load_documents_rejects_unknown_kind() {
        let input = "apiVersion: stratum.dev/v1alpha1\nkind: Pod\nspec: {}\n";
        assert!(load_documents(input).is_err());
    }

    #[test]
    fn test_load_documents_accepts_json() {
        let input = r#"{"apiVersion": "stratum.dev/v1alpha1", "kind": "Registry", "spec": {"endpoint": "localhost:5000", "insecure": true}}"#;
        let docs = load_documents(input).unwrap();
        match &docs[0] {
            Document::Registry { spec, .. } => {
                assert!(spec.insecure);
                assert_eq!(spec.host(), "localhost:5000");
            }
            other => panic!("expected registry document, got {:?}", other),
        }
    }

    #[test]
    fn test_registry_host_strips_scheme_and_path() {
        let spec = RegistrySpec {
            endpoint: "https://registry.example.com/v2/".to_string(),
            insecure: false,
            authentication: None,
        };
        assert_eq!(spec.host(), "registry.example.com");
    }

    #[test]
    fn test_platforms_filter_parsing() {
        let input = r#"
apiVersion: stratum.dev/v1alpha1
kind: Image
spec:
  match: "demo:{tag}"
  baseImage: "alpine:{tag}"
  platforms:
    - os: linux
      architecture: amd64
    - os: linux
      architecture: arm64
"#;
        let docs = load_documents(input).unwrap();
        match &docs[0] {
            Document::Image { spec, .. } => {
                let platforms = spec.platforms.as_ref().unwrap();
                assert_eq!(platforms.len(), 2);
                assert_eq!(platforms[1].architecture, "arm64");
            }
            other => panic!("expected image document, got {:?}", other),
        }
    }
}
