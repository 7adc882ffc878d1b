//! Blob operations for the registry

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use blob_storage::Digest;
use bytes::Bytes;

use crate::api::{RegistryState, validate_repository};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::DOCKER_CONTENT_DIGEST;
use crate::upload;

const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Router for blob operations
pub(crate) fn router() -> Router<RegistryState> {
    Router::new()
        .route(
            "/v2/{name}/blobs/{digest}",
            get(get_blob).head(head_blob).delete(delete_blob),
        )
        .route("/v2/{name}/blobs/uploads/", post(start_blob_upload))
        .route(
            "/v2/{name}/blobs/uploads/{uuid}",
            get(blob_upload_status)
                .patch(patch_blob_upload)
                .put(complete_blob_upload)
                .delete(cancel_blob_upload),
        )
}

/// Query parameters accepted when starting or completing an upload
#[derive(Debug, Default, serde::Deserialize)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
}

/// Get a blob
async fn get_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest: Digest = digest.parse()?;

    let data = state.blobs.get(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest: Digest = digest.parse()?;

    let metadata = state.blobs.metadata(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, metadata.size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
async fn delete_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    let digest: Digest = digest.parse()?;

    state.blobs.delete(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Start a blob upload session
///
/// With `?digest=` the body is the whole blob and is stored immediately. With
/// `?mount=` an existing blob is linked without any upload, since blobs are
/// shared across repositories.
async fn start_blob_upload(
    State(state): State<RegistryState>,
    Path(name): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    if let Some(digest) = query.digest {
        let digest: Digest = digest.parse()?;
        return store_blob(&state, &name, digest, body).await;
    }

    if let Some(mount) = query.mount {
        let digest: Digest = mount.parse()?;
        if state.blobs.exists(&digest).await? {
            return Ok(blob_created(&name, &digest));
        }
    }

    let uuid = state.uploads.start();
    let location = format!("/v2/{}/blobs/uploads/{}", name, uuid);

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, location),
            (header::RANGE, upload::range(0)),
            (DOCKER_UPLOAD_UUID, uuid.to_string()),
        ],
    )
        .into_response())
}

/// Report how much of an upload has been received
async fn blob_upload_status(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let received = state.uploads.received(&uuid)?;
    Ok(upload_in_progress(StatusCode::NO_CONTENT, &name, &uuid, received))
}

/// Append a chunk to an upload
async fn patch_blob_upload(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let offset = content_range_start(&headers)?;
    let received = state.uploads.append(&uuid, offset, &body)?;

    Ok(upload_in_progress(StatusCode::ACCEPTED, &name, &uuid, received))
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let digest: Digest = query
        .digest
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".to_string()))?
        .parse()?;

    if !body.is_empty() {
        state.uploads.append(&uuid, None, &body)?;
    }
    let data = state.uploads.finish(&uuid)?;

    store_blob(&state, &name, digest, data).await
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;

    state.uploads.cancel(&uuid)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Verify uploaded content against its digest and store it
async fn store_blob(
    state: &RegistryState,
    name: &str,
    digest: Digest,
    data: Bytes,
) -> RegistryResult<Response> {
    if !digest.verify(&data) {
        return Err(RegistryError::DigestMismatch {
            expected: digest.to_string(),
            actual: Digest::sha256(&data).to_string(),
        });
    }

    state.blobs.put(&digest, data).await?;
    tracing::debug!(repository = %name, %digest, "stored blob");

    Ok(blob_created(name, &digest))
}

fn blob_created(name: &str, digest: &Digest) -> Response {
    let location = format!("/v2/{}/blobs/{}", name, digest);

    (
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response()
}

fn upload_in_progress(status: StatusCode, name: &str, uuid: &str, received: u64) -> Response {
    let location = format!("/v2/{}/blobs/uploads/{}", name, uuid);

    (
        status,
        [
            (header::LOCATION, location),
            (header::RANGE, upload::range(received)),
            (DOCKER_UPLOAD_UUID, uuid.to_string()),
        ],
    )
        .into_response()
}

/// The start offset from a `Content-Range: <start>-<end>` header, if present.
fn content_range_start(headers: &HeaderMap) -> RegistryResult<Option<u64>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|range| range.split_once('-'))
        .and_then(|(start, _)| start.trim().parse().ok())
        .map(Some)
        .ok_or(RegistryError::RangeNotSatisfiable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_start(&headers).unwrap(), None);

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("10-19"));
        assert_eq!(content_range_start(&headers).unwrap(), Some(10));

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bogus"));
        assert!(content_range_start(&headers).is_err());
    }
}
