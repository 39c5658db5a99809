//! Storage push and redirect.
//!
//! A rule with a `storageImage` does not serve the built manifest itself.
//! The manifest request becomes ensure-then-redirect: probe the storage
//! registry for the substituted reference, build and push on a miss, then
//! send the client a temporary redirect to the storage registry (or the
//! configured proxy in front of it). Blobs are then pulled by the client
//! from the storage registry directly.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use oci_distribution::client::{Config, ImageLayer};
use oci_distribution::manifest::{OciImageIndex, OciImageManifest};
use oci_distribution::Reference;

use stratum_core::{Error, Result};

use crate::http::{internal_error, registry_error, AppState};
use crate::media;
use crate::rule::Action;

/// Make sure the storage registry holds the built image, then redirect.
pub(crate) async fn ensure_and_redirect(
    state: &AppState,
    repository: &str,
    tag: &str,
    action: &Action,
    storage_image: &str,
) -> Response {
    let storage_ref: Reference = match storage_image.parse() {
        Ok(reference) => reference,
        Err(e) => {
            return internal_error(&Error::ConfigInvalid(format!(
                "storage image {storage_image:?}: {e}"
            )));
        }
    };

    if let Err(probe) = state.upstream.head(&storage_ref).await {
        tracing::info!(
            storage = %storage_ref,
            reason = %probe,
            "storage image missing, building"
        );

        let pushed = state
            .gate
            .run(action.matched(), || async {
                state.builder.build(action.matched(), action).await?;
                push_from_store(state, repository, tag, &storage_ref).await
            })
            .await;
        if let Err(e) = pushed {
            tracing::error!(storage = %storage_ref, error = %e, "build and push failed");
            return internal_error(&e);
        }
    }

    let target = match redirect_reference(state, storage_image, &storage_ref) {
        Ok(reference) => reference,
        Err(e) => return internal_error(&e),
    };
    let location = reference_url(state, &target);

    tracing::info!(image = %repository, to = %location, "redirect");
    match header::HeaderValue::from_str(&location) {
        Ok(value) => {
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, value)]).into_response()
        }
        Err(_) => registry_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "unrepresentable redirect location",
        ),
    }
}

/// The reference the client is redirected to: the storage reference, or
/// the proxy-prefixed one when a proxy is configured.
fn redirect_reference(
    state: &AppState,
    storage_image: &str,
    storage_ref: &Reference,
) -> Result<Reference> {
    match &state.storage_image_proxy {
        Some(proxy) => {
            let prefixed = format!("{}/{}", proxy.trim_end_matches('/'), storage_image);
            prefixed.parse().map_err(|e| {
                Error::ConfigInvalid(format!("storage image proxy reference {prefixed:?}: {e}"))
            })
        }
        None => Ok(storage_ref.clone()),
    }
}

/// Distribution URL of a reference's manifest endpoint.
fn reference_url(state: &AppState, reference: &Reference) -> String {
    let registry = reference.registry();
    let insecure = state
        .rules
        .credentials_for(registry)
        .map(|c| c.insecure)
        .unwrap_or(false);
    let scheme = if insecure { "http" } else { "https" };

    let identifier = reference
        .digest()
        .or_else(|| reference.tag())
        .unwrap_or("latest");

    format!(
        "{scheme}://{}/v2/{}/manifests/{identifier}",
        reference.resolve_registry(),
        reference.repository(),
    )
}

/// Push the locally built `repository:tag` to the storage reference,
/// blobs first, child manifests by digest, the index last.
async fn push_from_store(
    state: &AppState,
    repository: &str,
    tag: &str,
    storage_ref: &Reference,
) -> Result<()> {
    let manifest_path = state.store.manifest_path(repository, tag);
    let bytes = tokio::fs::read(&manifest_path).await?;

    let probe: serde_json::Value = serde_json::from_slice(&bytes)?;
    let media_type = probe.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

    if media_type == media::OCI_INDEX || media_type == media::DOCKER_MANIFEST_LIST {
        let index: OciImageIndex = serde_json::from_slice(&bytes)?;

        for child in &index.manifests {
            let child_bytes = tokio::fs::read(state.store.blob_path(&child.digest)).await?;
            let child_manifest: OciImageManifest = serde_json::from_slice(&child_bytes)?;
            let child_ref = Reference::with_digest(
                storage_ref.registry().to_string(),
                storage_ref.repository().to_string(),
                child.digest.clone(),
            );
            push_image(state, child_manifest, &child_ref).await?;
        }

        let (client, auth) = state.upstream.client_and_auth(storage_ref);
        client
            .push_manifest_list(storage_ref, &auth, index)
            .await
            .map_err(|e| Error::Upstream {
                reference: storage_ref.whole(),
                message: e.to_string(),
                status: None,
            })?;
    } else {
        let manifest: OciImageManifest = serde_json::from_slice(&bytes)?;
        push_image(state, manifest, storage_ref).await?;
    }

    tracing::info!(storage = %storage_ref, "pushed image");
    Ok(())
}

/// Push one single-platform image: its layers and config from the CAS,
/// then the exact manifest document.
async fn push_image(
    state: &AppState,
    manifest: OciImageManifest,
    reference: &Reference,
) -> Result<()> {
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for descriptor in &manifest.layers {
        let data = tokio::fs::read(state.store.blob_path(&descriptor.digest)).await?;
        layers.push(ImageLayer::new(data, descriptor.media_type.clone(), None));
    }

    let config_bytes = tokio::fs::read(state.store.blob_path(&manifest.config.digest)).await?;
    let config = Config::new(config_bytes, manifest.config.media_type.clone(), None);

    let (client, auth) = state.upstream.client_and_auth(reference);
    client
        .push(reference, &layers, config, &auth, Some(manifest))
        .await
        .map_err(|e| Error::Upstream {
            reference: reference.whole(),
            message: e.to_string(),
            status: None,
        })?;

    Ok(())
}
