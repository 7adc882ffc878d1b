//! Manifest operations for the registry

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;

use crate::api::{RegistryState, validate_repository};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::Reference;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Router for manifest operations
pub(crate) fn router() -> Router<RegistryState> {
    Router::new()
        .route(
            "/v2/{name}/manifests/{reference}",
            get(get_manifest)
                .head(head_manifest)
                .put(put_manifest)
                .delete(delete_manifest),
        )
        .route("/v2/{name}/tags/list", get(list_tags))
}

/// Get a manifest
async fn get_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let reference = Reference::parse(&reference)?;

    let (digest, manifest) = state.manifests.get(&name, &reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.content_type),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        manifest.data,
    )
        .into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let reference = Reference::parse(&reference)?;

    let (digest, manifest) = state.manifests.get(&name, &reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.content_type),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, manifest.data.len().to_string()),
        ],
    )
        .into_response())
}

/// Put a manifest
async fn put_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let reference = Reference::parse(&reference)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| detect_manifest_type(&body));

    validate_manifest_type(&content_type)?;

    let digest = state
        .manifests
        .put(&name, &reference, &content_type, body)
        .await?;

    tracing::debug!(repository = %name, %reference, %digest, "stored manifest");

    let location = format!("/v2/{}/manifests/{}", name, digest);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a manifest
async fn delete_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    let reference = Reference::parse(&reference)?;

    state.manifests.delete(&name, &reference).await?;
    Ok(StatusCode::ACCEPTED)
}

/// List tags for a repository
async fn list_tags(
    State(state): State<RegistryState>,
    Path(name): Path<String>,
) -> RegistryResult<Json<TagList>> {
    validate_repository(&name)?;

    let tags = state.manifests.tags(&name).await?;

    Ok(Json(TagList { name, tags }))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

/// Detect manifest type from content
pub(crate) fn detect_manifest_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        if let Some(schema_version) = json.get("schemaVersion").and_then(|v| v.as_u64()) {
            return match schema_version {
                1 => "application/vnd.docker.distribution.manifest.v1+json".to_string(),
                2 if json.get("manifests").is_some() => {
                    "application/vnd.oci.image.index.v1+json".to_string()
                }
                _ => OCI_MANIFEST.to_string(),
            };
        }
    }

    OCI_MANIFEST.to_string()
}

/// Validate manifest type
fn validate_manifest_type(content_type: &str) -> RegistryResult<()> {
    match content_type {
        "application/vnd.docker.distribution.manifest.v1+json"
        | "application/vnd.docker.distribution.manifest.v1+prettyjws"
        | "application/vnd.docker.distribution.manifest.v2+json"
        | "application/vnd.docker.distribution.manifest.list.v2+json"
        | "application/vnd.oci.image.manifest.v1+json"
        | "application/vnd.oci.image.index.v1+json" => Ok(()),
        _ => Err(RegistryError::UnsupportedManifestType(
            content_type.to_string(),
        )),
    }
}
