//! Sync blob and profile identifier endpoints.

use super::principal::{profile_header, Principal};
use crate::error::{Result, ServerError, StorageError};
use crate::server::SyncServer;
use axum::body::Bytes;
use axum::http::header::{CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::{ETag, ProfileId};

/// Parsed `If-Match` / `If-None-Match` value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Precondition {
    /// `*`: any current version.
    Any,
    /// A list of entity tags.
    Tags(Vec<ETag>),
}

impl Precondition {
    fn from_headers(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<Self> {
        let raw = headers.get(name)?.to_str().ok()?.trim();
        if raw == "*" {
            return Some(Self::Any);
        }
        let tags: Vec<ETag> = raw
            .split(',')
            .map(|tag| {
                let tag = tag.trim();
                let tag = tag.strip_prefix("W/").unwrap_or(tag);
                ETag::new(tag.trim_matches('"'))
            })
            .filter(|tag| !tag.as_str().is_empty())
            .collect();
        Some(Self::Tags(tags))
    }

    fn matches(&self, current: &ETag) -> bool {
        match self {
            Self::Any => true,
            Self::Tags(tags) => tags.contains(current),
        }
    }
}

fn etag_value(etag: &ETag) -> Result<HeaderValue> {
    HeaderValue::try_from(format!("\"{}\"", etag.as_str())).map_err(|_| {
        ServerError::from(StorageError::CorruptRow {
            table: "sync_records",
            reason: "etag is not a valid header value".to_string(),
        })
    })
}

fn count_failure(server: &SyncServer, err: ServerError) -> ServerError {
    if err.status().is_server_error() {
        server.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
    }
    err
}

/// `GET /v1/sync`
pub async fn read_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    principal: Principal,
    headers: HeaderMap,
) -> Result<Response> {
    read(&server, &principal, &headers)
        .await
        .map_err(|e| count_failure(&server, e))
}

async fn read(server: &SyncServer, principal: &Principal, headers: &HeaderMap) -> Result<Response> {
    let coordinator = server.coordinator();
    let metrics = server.metrics();

    if let Some(cached) = Precondition::from_headers(headers, IF_NONE_MATCH) {
        if let Some(current) = coordinator.peek_etag(&principal.owner).await? {
            if cached.matches(&current) {
                metrics.not_modified_total.fetch_add(1, Ordering::Relaxed);
                return Ok((StatusCode::NOT_MODIFIED, [(ETAG, etag_value(&current)?)]).into_response());
            }
        }
    }

    let Some((blob, etag)) = coordinator.read(&principal.owner).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    metrics.reads_total.fetch_add(1, Ordering::Relaxed);
    metrics
        .bytes_sent
        .fetch_add(blob.len() as u64, Ordering::Relaxed);
    Ok((
        StatusCode::OK,
        [
            (ETAG, etag_value(&etag)?),
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        ],
        blob,
    )
        .into_response())
}

/// `GET /v1/sync/etag`
pub async fn etag_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    principal: Principal,
) -> Result<Response> {
    let current = server
        .coordinator()
        .peek_etag(&principal.owner)
        .await
        .map_err(|e| count_failure(&server, e))?;
    match current {
        Some(etag) => Ok((StatusCode::NO_CONTENT, [(ETAG, etag_value(&etag)?)]).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// `PUT /v1/sync`
pub async fn write_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    principal: Principal,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let written = write(&server, &principal, &headers, &body)
        .await
        .map_err(|e| count_failure(&server, e))?;

    let Some(etag) = written else {
        server.metrics().conflicts_total.fetch_add(1, Ordering::Relaxed);
        return Ok(StatusCode::PRECONDITION_FAILED.into_response());
    };

    let metrics = server.metrics();
    metrics.writes_total.fetch_add(1, Ordering::Relaxed);
    metrics
        .bytes_received
        .fetch_add(body.len() as u64, Ordering::Relaxed);

    spawn_promotion(&server, &principal, &headers);
    Ok((StatusCode::OK, [(ETAG, etag_value(&etag)?)]).into_response())
}

async fn write(
    server: &SyncServer,
    principal: &Principal,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<ETag>> {
    let coordinator = server.coordinator();
    let owner = &principal.owner;

    let expected = match Precondition::from_headers(headers, IF_MATCH) {
        None => return coordinator.write(owner, body).await.map(Some),
        Some(Precondition::Tags(tags)) if tags.len() == 1 => tags.into_iter().next(),
        Some(precondition) => coordinator
            .peek_etag(owner)
            .await?
            .filter(|current| precondition.matches(current)),
    };

    match expected {
        Some(expected) => coordinator.write_if_match(owner, &expected, body).await,
        None => {
            // Still reject oversize bodies the same way an unconditional write would.
            coordinator.check_size(body)?;
            Ok(None)
        }
    }
}

/// Promote the caller's profile identifier off the request path.
fn spawn_promotion(server: &Arc<SyncServer>, principal: &Principal, headers: &HeaderMap) {
    let Some(raw) = profile_header(headers) else {
        return;
    };
    let identifier = match ProfileId::new(raw) {
        Ok(identifier) => identifier,
        Err(e) => {
            tracing::debug!("Ignoring bad profile header from {}: {}", principal.owner, e);
            return;
        }
    };

    let server = server.clone();
    let owner = principal.owner.clone();
    tokio::spawn(async move {
        if let Err(e) = server.identity().promote(&owner, &identifier).await {
            server
                .metrics()
                .promotion_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Promotion of {:?} for {} failed: {}", identifier, owner, e);
        }
    });
}

/// Body of `GET /v1/profile`.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileResponse {
    /// The caller's current profile identifier.
    pub identifier: String,
}

/// `GET /v1/profile`
pub async fn profile_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    principal: Principal,
) -> Result<Json<ProfileResponse>> {
    let identifier = server
        .identity()
        .get_or_create(&principal.owner)
        .await
        .map_err(|e| count_failure(&server, e))?;
    server
        .metrics()
        .profile_lookups_total
        .fetch_add(1, Ordering::Relaxed);
    Ok(Json(ProfileResponse {
        identifier: identifier.as_str().to_string(),
    }))
}
