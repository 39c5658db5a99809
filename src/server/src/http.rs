//! Distribution v2 front-end.
//!
//! Serves the pull side of the registry API: `GET /v2/`, blobs by digest,
//! manifests by digest or tag. A tag request whose manifest is not on
//! disk resolves a rule and triggers a coalesced build; everything else
//! streams straight from the content-addressed store. Errors leave the
//! process only in the distribution error schema.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use stratum_core::atomic::sha256_hex;
use stratum_core::{Error, Result};

use crate::flight::BuildGate;
use crate::image::ImageBuilder;
use crate::media;
use crate::push;
use crate::rules::RuleRegistry;
use crate::store::Store;
use crate::upstream::Upstream;

/// Shared state behind the HTTP surface.
pub struct AppState {
    pub store: Arc<Store>,
    pub rules: Arc<RuleRegistry>,
    pub upstream: Arc<Upstream>,
    pub builder: Arc<ImageBuilder>,
    pub gate: BuildGate,
    /// When set, storage redirects point at this proxy instead of the
    /// storage registry itself.
    pub storage_image_proxy: Option<String>,
}

/// Build the router. Paths are dispatched manually because repositories
/// contain slashes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(address: &str, state: Arc<AppState>) -> Result<()> {
    // `:8888` means every interface.
    let address = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| Error::Internal(format!("binding {address}: {e}")))?;
    tracing::info!(address = %address, "serving");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::Internal(format!("serving: {e}")))
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method = request.method();
    let head_only = method == Method::HEAD;
    if !head_only && method != Method::GET {
        return error_response(&Error::Unsupported(method.to_string()));
    }

    let path = request.uri().path();
    if !path.starts_with("/v2/") {
        return not_found();
    }
    if path == "/v2/" {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            "{}",
        )
            .into_response();
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 5 {
        return not_found();
    }

    let repository = parts[2..parts.len() - 2].join("/");
    let kind = parts[parts.len() - 2];
    let identifier = parts[parts.len() - 1];

    match kind {
        "blobs" => serve_blob(&state, identifier, head_only).await,
        "manifests" => serve_manifests(&state, &repository, identifier, head_only).await,
        _ => not_found(),
    }
}

/// Stream a blob from the store.
async fn serve_blob(state: &AppState, digest: &str, head_only: bool) -> Response {
    let path = state.store.blob_path(digest);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response(&Error::BlobUnknown(digest.to_string()));
        }
        Err(e) => return internal_error(&Error::Io(e)),
    };

    let meta = match file.metadata().await {
        Ok(meta) => meta,
        Err(e) => return internal_error(&Error::Io(e)),
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, media::OCTET_STREAM);
    insert_header(&mut headers, header::CONTENT_LENGTH, &meta.len().to_string());
    insert_header(&mut headers, "docker-content-digest", &prefixed(digest));
    if let Ok(modified) = meta.modified() {
        insert_header(
            &mut headers,
            header::LAST_MODIFIED,
            &httpdate::fmt_http_date(modified),
        );
    }

    if head_only {
        return (StatusCode::OK, headers).into_response();
    }
    let body = Body::from_stream(ReaderStream::new(file));
    (StatusCode::OK, headers, body).into_response()
}

async fn serve_manifests(
    state: &AppState,
    repository: &str,
    identifier: &str,
    head_only: bool,
) -> Response {
    // A digest always references blob storage directly.
    if identifier.starts_with("sha256:") {
        return serve_manifest_file(&state.store.blob_path(identifier), head_only).await;
    }

    let reference = format!("{repository}:{identifier}");
    let action = match state.rules.resolve(&reference) {
        Some(action) => action,
        None => return not_found(),
    };

    if let Some(storage_image) = action.storage_image() {
        return push::ensure_and_redirect(state, repository, identifier, &action, &storage_image)
            .await;
    }

    let manifest_path = state.store.manifest_path(repository, identifier);
    if !manifest_path.is_file() {
        let built = state
            .gate
            .run(&reference, || async {
                state.builder.build(&reference, &action).await
            })
            .await;
        if let Err(e) = built {
            tracing::error!(reference = %reference, error = %e, "build failed");
            return internal_error(&e);
        }
    }

    serve_manifest_file(&manifest_path, head_only).await
}

/// Serve a manifest or index document with its declared media type.
async fn serve_manifest_file(path: &Path, head_only: bool) -> Response {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
        Err(e) => return internal_error(&Error::Io(e)),
    };

    #[derive(Deserialize)]
    struct MediaTypeProbe {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    let probe: MediaTypeProbe = match serde_json::from_slice(&bytes) {
        Ok(probe) => probe,
        Err(e) => return internal_error(&Error::from(e)),
    };

    let mut headers = HeaderMap::new();
    insert_header(
        &mut headers,
        header::CONTENT_TYPE,
        probe.media_type.as_deref().unwrap_or(media::OCTET_STREAM),
    );
    insert_header(&mut headers, header::CONTENT_LENGTH, &bytes.len().to_string());
    insert_header(
        &mut headers,
        "docker-content-digest",
        &format!("sha256:{}", sha256_hex(&bytes)),
    );
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if let Ok(modified) = meta.modified() {
            insert_header(
                &mut headers,
                header::LAST_MODIFIED,
                &httpdate::fmt_http_date(modified),
            );
        }
    }

    if head_only {
        return (StatusCode::OK, headers).into_response();
    }
    (StatusCode::OK, headers, bytes).into_response()
}

fn prefixed(digest: &str) -> String {
    if digest.contains(':') {
        digest.to_string()
    } else {
        format!("sha256:{digest}")
    }
}

fn insert_header<K>(headers: &mut HeaderMap, key: K, value: &str)
where
    K: header::IntoHeaderName,
{
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(key, value);
    }
}

/// A response in the distribution error schema.
pub(crate) fn registry_error(status: StatusCode, code: &str, message: &str) -> Response {
    let body = json!({
        "errors": [{"code": code, "message": message}],
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Map an error kind onto the distribution schema. Only the four
/// distribution codes ever leave the process.
pub(crate) fn error_response(err: &Error) -> Response {
    let (status, code) = match err {
        Error::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::BlobUnknown(_) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
        Error::Unsupported(_) => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    registry_error(status, code, &err.to_string())
}

pub(crate) fn not_found() -> Response {
    error_response(&Error::NotFound)
}

pub(crate) fn internal_error(err: &Error) -> Response {
    error_response(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(tmp: &TempDir) -> (Router, Arc<AppState>) {
        let store = Arc::new(Store::open(&tmp.path().join("cache")).unwrap());
        let rules = Arc::new(RuleRegistry::new(vec![]).unwrap());
        let upstream = Arc::new(Upstream::new(Arc::clone(&rules)));
        let builder = Arc::new(ImageBuilder::new(Arc::clone(&store), Arc::clone(&upstream)));
        let state = Arc::new(AppState {
            store,
            rules,
            upstream,
            builder,
            gate: BuildGate::new(),
            storage_image_proxy: None,
        });
        (router(Arc::clone(&state)), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_api_base() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let response = app.oneshot(get("/v2/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn test_non_v2_prefix_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let response = app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["errors"][0]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_wrong_method_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v2/demo/blobs/uploads/")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_json(response).await["errors"][0]["code"], "UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_unknown_blob() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let digest = format!("sha256:{}", "0".repeat(64));
        let response = app
            .oneshot(get(&format!("/v2/demo/blobs/{digest}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["errors"][0]["code"],
            "BLOB_UNKNOWN"
        );
    }

    #[tokio::test]
    async fn test_serve_blob_with_headers() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = app(&tmp);

        let digest = state.store.put_blob(b"layer bytes").unwrap();
        let response = app
            .oneshot(get(&format!("/v2/example.com/demo/blobs/{digest}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            media::OCTET_STREAM
        );
        assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
        assert!(response.headers().contains_key(header::LAST_MODIFIED));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"layer bytes");
    }

    #[tokio::test]
    async fn test_head_blob_has_no_body() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = app(&tmp);

        let digest = state.store.put_blob(b"layer bytes").unwrap();
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(format!("/v2/demo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_by_digest_serves_blob_with_media_type() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = app(&tmp);

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:aa", "size": 2},
            "layers": [],
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let digest = state.store.put_blob(&bytes).unwrap();

        let response = app
            .oneshot(get(&format!("/v2/example.com/demo/manifests/{digest}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            media::OCI_MANIFEST
        );
        assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
    }

    #[tokio::test]
    async fn test_manifest_tag_without_rule_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let response = app
            .oneshot(get("/v2/example.com/demo/manifests/3.20"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["errors"][0]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_manifest_tag_served_from_cache_without_building() {
        let tmp = TempDir::new().unwrap();
        let (app, state) = app(&tmp);

        // A matching rule plus a pre-existing tag pointer: the handler
        // must serve the file without consulting upstream.
        state.rules.upsert_image(
            "demo".to_string(),
            stratum_core::config::ImageSpec {
                pattern: "example.com/demo:{tag}".to_string(),
                base_image: "alpine:{tag}".to_string(),
                mutates: vec![],
                storage_image: None,
                platforms: None,
            },
        );
        let manifest = json!({"schemaVersion": 2, "mediaType": media::DOCKER_MANIFEST});
        let bytes = serde_json::to_vec(&manifest).unwrap();
        state.store.write_tag("example.com/demo", "3.20", &bytes).unwrap();

        let response = app
            .oneshot(get("/v2/example.com/demo/manifests/3.20"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            media::DOCKER_MANIFEST
        );
    }

    #[tokio::test]
    async fn test_short_path_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (app, _) = app(&tmp);

        let response = app.oneshot(get("/v2/demo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
