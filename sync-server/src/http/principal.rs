//! Caller identity as forwarded by the upstream authentication layer.

use crate::error::ServerError;
use crate::limits::RateLimitSubject;
use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use sync_types::OwnerKey;

/// Header carrying the authenticated account key.
pub const OWNER_HEADER: &str = "x-owner-key";
/// Header carrying the principal's role.
pub const ROLE_HEADER: &str = "x-principal-role";
/// Header carrying the session's profile identifier on writes.
pub const PROFILE_HEADER: &str = "x-profile-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Account the request acts on.
    pub owner: OwnerKey,
    /// Role, if the authentication layer supplied one.
    pub role: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = header_str(&parts.headers, OWNER_HEADER).ok_or(ServerError::Unauthenticated)?;
        Ok(Self {
            owner: OwnerKey::new(raw)?,
            role: header_str(&parts.headers, ROLE_HEADER).map(str::to_owned),
        })
    }
}

/// Profile identifier header value, if present.
pub fn profile_header(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, PROFILE_HEADER)
}

/// Build the rate limit subject for a request.
///
/// Falls back to the unspecified address when the router was served without
/// connection info.
pub fn rate_limit_subject(parts: &Parts) -> RateLimitSubject {
    let address = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    RateLimitSubject {
        principal: header_str(&parts.headers, OWNER_HEADER).map(str::to_owned),
        role: header_str(&parts.headers, ROLE_HEADER).map(str::to_owned),
        address,
    }
}
