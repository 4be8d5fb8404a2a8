//! Request handlers for the `/v2/` surface.
//!
//! Every path under `/v2/` arrives at [`oci_dispatch`], which splits it into
//! a repository name and an endpoint. Repository names may contain any number
//! of `/`, so axum's router cannot do the split by itself.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::{ReaderStream, StreamReader};

use hauler::{Digest, Reference, Store};

use crate::error::RegistryError;

/// Largest manifest body accepted on PUT.
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const DOCKER_UPLOAD_UUID: &str = "docker-upload-uuid";
const LOCATION: &str = "location";
const RANGE: &str = "range";
const CONTENT_RANGE: &str = "content-range";

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub(crate) store: Arc<Store>,
    pub(crate) read_only: bool,
}

type HandlerResult = Result<Response, RegistryError>;

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), RegistryError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| RegistryError::Internal(format!("invalid value for {name}: {e}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OciRoute {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    BlobUploadStart { name: String },
    BlobUpload { name: String, session: String },
    TagsList { name: String },
}

fn parse_oci_path(path: &str) -> Option<OciRoute> {
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some(name) = path.strip_suffix("/tags/list") {
        return (!name.is_empty()).then(|| OciRoute::TagsList {
            name: name.to_string(),
        });
    }

    if let Some(name) = path
        .strip_suffix("/blobs/uploads/")
        .or_else(|| path.strip_suffix("/blobs/uploads"))
    {
        return (!name.is_empty()).then(|| OciRoute::BlobUploadStart {
            name: name.to_string(),
        });
    }

    // The route is decided by the last segments only; a repository may
    // itself contain `blobs` or `manifests` components.
    let (rest, last) = path.rsplit_once('/')?;
    let (name, kind) = rest.rsplit_once('/')?;
    if name.is_empty() || last.is_empty() {
        return None;
    }
    match kind {
        "manifests" => Some(OciRoute::Manifest {
            name: name.to_string(),
            reference: last.to_string(),
        }),
        "blobs" => Some(OciRoute::Blob {
            name: name.to_string(),
            digest: last.to_string(),
        }),
        "uploads" => {
            let name = name.strip_suffix("/blobs")?;
            (!name.is_empty()).then(|| OciRoute::BlobUpload {
                name: name.to_string(),
                session: last.to_string(),
            })
        }
        _ => None,
    }
}

impl OciRoute {
    fn name(&self) -> &str {
        match self {
            OciRoute::Manifest { name, .. }
            | OciRoute::Blob { name, .. }
            | OciRoute::BlobUploadStart { name }
            | OciRoute::BlobUpload { name, .. }
            | OciRoute::TagsList { name } => name,
        }
    }
}

fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// `GET /v2/`.
pub(crate) async fn v2_base() -> impl IntoResponse {
    Json(serde_json::json!({}))
}

/// Everything below `/v2/`.
pub(crate) async fn oci_dispatch(
    method: Method,
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> HandlerResult {
    let route = parse_oci_path(&path).ok_or_else(|| RegistryError::NameUnknown(path.clone()))?;
    let name = route.name();
    Reference::new(None, name, None, None).map_err(|_| RegistryError::NameInvalid(name.to_string()))?;

    if is_mutation(&method) {
        if state.read_only {
            return Err(RegistryError::ReadOnly);
        }
        if method == Method::DELETE {
            return Err(RegistryError::Unsupported("deletion".to_string()));
        }
    }

    match route {
        OciRoute::Manifest { name, reference } => match method {
            Method::GET | Method::HEAD => get_manifest(&state, method, &name, &reference).await,
            Method::PUT => put_manifest(&state, &name, &reference, &headers, body).await,
            _ => Err(RegistryError::Unsupported(format!("{method} on manifests"))),
        },
        OciRoute::Blob { name, digest } => match method {
            Method::GET | Method::HEAD => get_blob(&state, method, &name, &digest).await,
            _ => Err(RegistryError::Unsupported(format!("{method} on blobs"))),
        },
        OciRoute::BlobUploadStart { name } => match method {
            Method::POST => start_upload(&state, &name, &params, body).await,
            _ => Err(RegistryError::Unsupported(format!("{method} on uploads"))),
        },
        OciRoute::BlobUpload { name, session } => match method {
            Method::GET => get_upload_status(&state, &name, &session).await,
            Method::PATCH => patch_upload(&state, &name, &session, &headers, body).await,
            Method::PUT => put_upload(&state, &name, &session, &params, &headers, body).await,
            _ => Err(RegistryError::Unsupported(format!("{method} on upload sessions"))),
        },
        OciRoute::TagsList { name } => match method {
            Method::GET => list_tags(&state, &name, &params).await,
            _ => Err(RegistryError::Unsupported(format!("{method} on tags"))),
        },
    }
}

fn parse_digest(digest: &str) -> Result<Digest, RegistryError> {
    Ok(digest.parse::<Digest>()?)
}

fn body_reader(body: Body) -> impl tokio::io::AsyncRead + Unpin {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

async fn get_manifest(state: &AppState, method: Method, name: &str, reference: &str) -> HandlerResult {
    let descriptor = state.store.resolve_manifest(name, reference).await?;
    let (file, size) = state.store.open_blob(&descriptor.digest).await?;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, DOCKER_CONTENT_DIGEST, &descriptor.digest.to_string())?;
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&descriptor.media_type)
            .map_err(|e| RegistryError::Internal(format!("invalid media type: {e}")))?,
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));

    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn get_blob(state: &AppState, method: Method, _name: &str, digest: &str) -> HandlerResult {
    let digest = parse_digest(digest)?;
    let (file, size) = state.store.open_blob(&digest).await?;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, DOCKER_CONTENT_DIGEST, &digest.to_string())?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));

    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

fn blob_created(name: &str, digest: &Digest) -> HandlerResult {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, LOCATION, &format!("/v2/{name}/blobs/{digest}"))?;
    insert_header(&mut headers, DOCKER_CONTENT_DIGEST, &digest.to_string())?;
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    Ok((StatusCode::CREATED, headers, Body::empty()).into_response())
}

fn upload_progress(status: StatusCode, name: &str, session: &str, len: u64) -> HandlerResult {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, LOCATION, &format!("/v2/{name}/blobs/uploads/{session}"))?;
    insert_header(&mut headers, DOCKER_UPLOAD_UUID, session)?;
    insert_header(&mut headers, RANGE, &format!("0-{}", len.saturating_sub(1)))?;
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    Ok((status, headers, Body::empty()).into_response())
}

async fn start_upload(
    state: &AppState,
    name: &str,
    params: &HashMap<String, String>,
    body: Body,
) -> HandlerResult {
    if let Some(digest) = params.get("digest") {
        let digest = parse_digest(digest)?;
        let size = state.store.upload_blob(&digest, body_reader(body)).await?;
        tracing::debug!(%digest, size, "monolithic upload to {name}");
        return blob_created(name, &digest);
    }
    let session = state.store.uploads().start().await?;
    tracing::debug!(session = %session.id(), "opened upload for {name}");
    upload_progress(StatusCode::ACCEPTED, name, &session.id().to_string(), 0)
}

async fn get_upload_status(state: &AppState, name: &str, session: &str) -> HandlerResult {
    let upload = state.store.uploads().get(session).await?;
    let len = upload.len().await?;
    upload_progress(StatusCode::NO_CONTENT, name, session, len)
}

/// Start offset of a `Content-Range` header (`<start>-<end>`, optionally
/// prefixed with `bytes ` and suffixed with `/<total>`).
fn parse_content_range(headers: &HeaderMap) -> Result<Option<u64>, RegistryError> {
    let Some(value) = headers.get(CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || RegistryError::RangeInvalid(format!("{value:?}"));
    let value = value.to_str().map_err(|_| invalid())?.trim();
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let range = value.split('/').next().unwrap_or(value);
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok(Some(start))
}

async fn patch_upload(
    state: &AppState,
    name: &str,
    session: &str,
    headers: &HeaderMap,
    body: Body,
) -> HandlerResult {
    let start = parse_content_range(headers)?;
    let upload = state.store.uploads().get(session).await?;
    let len = upload.append(start, body_reader(body)).await?;
    upload_progress(StatusCode::ACCEPTED, name, session, len)
}

async fn put_upload(
    state: &AppState,
    name: &str,
    session: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Body,
) -> HandlerResult {
    let digest = params
        .get("digest")
        .ok_or_else(|| hauler::Error::InvalidDigest("missing digest parameter".to_string()))?;
    let digest = parse_digest(digest)?;
    let start = parse_content_range(headers)?;
    let upload = state.store.uploads().get(session).await?;
    upload.append(start, body_reader(body)).await?;
    let size = state.store.finalize_upload(upload, &digest).await?;
    tracing::debug!(%digest, size, "finalized upload {session} for {name}");
    blob_created(name, &digest)
}

async fn put_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> HandlerResult {
    let data = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|e| hauler::Error::InvalidManifest(format!("reading body: {e}")))?;
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let descriptor = state
        .store
        .put_manifest(name, reference, &data, content_type)
        .await?;

    let mut headers = HeaderMap::new();
    insert_header(
        &mut headers,
        LOCATION,
        &format!("/v2/{name}/manifests/{}", descriptor.digest),
    )?;
    insert_header(&mut headers, DOCKER_CONTENT_DIGEST, &descriptor.digest.to_string())?;
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    Ok((StatusCode::CREATED, headers, Body::empty()).into_response())
}

#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

async fn list_tags(state: &AppState, name: &str, params: &HashMap<String, String>) -> HandlerResult {
    let tags = match state.store.tags(name).await {
        Ok(tags) => tags,
        Err(hauler::Error::ReferenceNotFound(_)) => {
            return Err(RegistryError::NameUnknown(name.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let after = params.get("last");
    let mut tags: Vec<String> = tags
        .into_iter()
        .filter(|t| after.is_none_or(|last| t > last))
        .collect();
    if let Some(n) = params.get("n").and_then(|n| n.parse::<usize>().ok()) {
        tags.truncate(n);
    }
    Ok(Json(TagList {
        name: name.to_string(),
        tags,
    })
    .into_response())
}
