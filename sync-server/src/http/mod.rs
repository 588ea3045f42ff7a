//! HTTP endpoints for profile-sync.
//!
//! | Route | Method | |
//! |---|---|---|
//! | `/health` | GET | liveness and database check |
//! | `/metrics` | GET | Prometheus counters (when enabled) |
//! | `/v1/sync` | GET, PUT | ETag-gated blob read and write |
//! | `/v1/sync/etag` | GET | current ETag only |
//! | `/v1/profile` | GET | current profile identifier |
//!
//! Everything under `/v1` is rate limited.

mod error;
pub mod health;
mod metrics;
pub mod principal;
mod ratelimit;
mod sync;

use crate::server::SyncServer;
use axum::extract::DefaultBodyLimit;
use axum::{middleware, routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;
pub use ratelimit::{LIMIT_HEADER, REMAINING_HEADER};
pub use sync::ProfileResponse;

/// Build the HTTP router with all endpoints.
///
/// The request body limit is taken from the config at this point.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    let config = server.config();

    let api = Router::new()
        .route("/v1/sync", get(sync::read_handler).put(sync::write_handler))
        .route("/v1/sync/etag", get(sync::etag_handler))
        .route("/v1/profile", get(sync::profile_handler))
        .layer(middleware::from_fn(ratelimit::rate_limit_middleware))
        .layer(DefaultBodyLimit::max(config.storage.max_blob_size));

    let mut router = Router::new().route("/health", get(health::health_handler));
    if config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    router.merge(api).layer(Extension(server))
}

#[cfg(test)]
mod tests {
    use super::principal::{OWNER_HEADER, PROFILE_HEADER};
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Config, ConfigHandle};
    use crate::ephemeral::MemoryEphemeralStore;
    use crate::storage::{IdentifierStore, SqliteStorage};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::header::{ETAG, IF_MATCH, IF_NONE_MATCH, RETRY_AFTER};
    use axum::http::{Request, Response, StatusCode};
    use std::net::SocketAddr;
    use std::time::Duration;
    use sync_types::OwnerKey;
    use tower::util::ServiceExt;

    async fn test_server(config: Config) -> Arc<SyncServer> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        Arc::new(SyncServer::new(
            ConfigHandle::new(config),
            storage,
            Arc::new(MemoryEphemeralStore::new(clock.clone())),
            clock,
        ))
    }

    fn get_as(uri: &str, owner: &str) -> axum::http::request::Builder {
        Request::builder().uri(uri).header(OWNER_HEADER, owner)
    }

    fn put_as(owner: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("PUT")
            .uri("/v1/sync")
            .header(OWNER_HEADER, owner)
    }

    async fn send(server: &Arc<SyncServer>, request: Request<Body>) -> Response<Body> {
        build_router(server.clone()).oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn etag_of(response: &Response<Body>) -> String {
        response.headers()[ETAG].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = test_server(Config::default()).await;
        let response = send(
            &server,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_counters() {
        let server = test_server(Config::default()).await;
        send(&server, put_as("u1").body(Body::from("abc")).unwrap()).await;

        let response = send(
            &server,
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("profile_sync_writes_total 1"));
        assert!(text.contains("profile_sync_bytes_received_total 3"));
        assert!(text.contains("profile_sync_records 1"));
        assert!(text.contains("profile_sync_cleanup_errors_total 0"));
        assert!(text.contains("profile_sync_active_identifiers 0"));
        assert!(text.contains(&format!(
            "profile_sync_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )));
        assert_eq!(text.matches("# TYPE ").count(), 15);
    }

    #[tokio::test]
    async fn metrics_endpoint_can_be_disabled() {
        let mut config = Config::default();
        config.server.metrics_enabled = false;
        let server = test_server(config).await;
        let response = send(
            &server,
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_owner_is_unauthorized() {
        let server = test_server(Config::default()).await;
        let response = send(
            &server,
            Request::builder().uri("/v1/sync").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn read_before_write_is_not_found() {
        let server = test_server(Config::default()).await;
        let response = send(&server, get_as("/v1/sync", "u1").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &server,
            get_as("/v1/sync/etag", "u1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn write_then_read_round_trip_with_etags() {
        let server = test_server(Config::default()).await;

        let written = send(&server, put_as("u1").body(Body::from(vec![1u8, 2, 3])).unwrap()).await;
        assert_eq!(written.status(), StatusCode::OK);
        let etag = etag_of(&written);

        let read = send(&server, get_as("/v1/sync", "u1").body(Body::empty()).unwrap()).await;
        assert_eq!(read.status(), StatusCode::OK);
        assert_eq!(etag_of(&read), etag);
        assert_eq!(body_bytes(read).await, vec![1, 2, 3]);

        let peek = send(
            &server,
            get_as("/v1/sync/etag", "u1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(peek.status(), StatusCode::NO_CONTENT);
        assert_eq!(etag_of(&peek), etag);

        let cached = send(
            &server,
            get_as("/v1/sync", "u1")
                .header(IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(cached.status(), StatusCode::NOT_MODIFIED);
        assert!(body_bytes(cached).await.is_empty());

        let outdated = send(
            &server,
            get_as("/v1/sync", "u1")
                .header(IF_NONE_MATCH, "\"other\"")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(outdated.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_etag() {
        let server = test_server(Config::default()).await;
        let first = send(&server, put_as("u1").body(Body::from(vec![1u8, 2, 3])).unwrap()).await;
        let e1 = etag_of(&first);

        let stale = send(
            &server,
            put_as("u1")
                .header(IF_MATCH, "\"stale\"")
                .body(Body::from(vec![9u8, 9]))
                .unwrap(),
        )
        .await;
        assert_eq!(stale.status(), StatusCode::PRECONDITION_FAILED);

        let read = send(&server, get_as("/v1/sync", "u1").body(Body::empty()).unwrap()).await;
        assert_eq!(body_bytes(read).await, vec![1, 2, 3]);

        let fresh = send(
            &server,
            put_as("u1")
                .header(IF_MATCH, &e1)
                .body(Body::from(vec![9u8, 9]))
                .unwrap(),
        )
        .await;
        assert_eq!(fresh.status(), StatusCode::OK);
        assert_ne!(etag_of(&fresh), e1);

        let replay = send(
            &server,
            put_as("u1")
                .header(IF_MATCH, &e1)
                .body(Body::from(vec![7u8]))
                .unwrap(),
        )
        .await;
        assert_eq!(replay.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn conditional_write_without_record_fails() {
        let server = test_server(Config::default()).await;
        for value in ["\"anything\"", "*"] {
            let response = send(
                &server,
                put_as("u1")
                    .header(IF_MATCH, value)
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        }
    }

    #[tokio::test]
    async fn wildcard_if_match_writes_existing_record() {
        let server = test_server(Config::default()).await;
        send(&server, put_as("u1").body(Body::from("a")).unwrap()).await;
        let response = send(
            &server,
            put_as("u1")
                .header(IF_MATCH, "*")
                .body(Body::from("b"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversize_blob_is_rejected() {
        let mut config = Config::default();
        config.storage.max_blob_size = 4;
        let server = test_server(config).await;

        let response = send(&server, put_as("u1").body(Body::from("too long")).unwrap()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(server.storage().count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn profile_lookup_is_stable() {
        let server = test_server(Config::default()).await;
        let mut seen = Vec::new();
        for _ in 0..2 {
            let response = send(
                &server,
                get_as("/v1/profile", "u1").body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
            seen.push(json["identifier"].as_str().unwrap().to_string());
        }
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn write_with_profile_header_promotes() {
        let server = test_server(Config::default()).await;
        let profile = server
            .identity()
            .get_or_create(&OwnerKey::new("u1").unwrap())
            .await
            .unwrap();

        let response = send(
            &server,
            put_as("u1")
                .header(PROFILE_HEADER, profile.as_str())
                .body(Body::from("data"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let owner = OwnerKey::new("u1").unwrap();
        let mut promoted = None;
        for _ in 0..50 {
            promoted = server.storage().find_active(&owner).await.unwrap();
            if promoted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(promoted.map(|row| row.identifier), Some(profile));
    }

    #[tokio::test]
    async fn rate_limit_headers_and_rejection() {
        let mut config = Config::default();
        config.limits.threshold = 2;
        config.limits.global_requests_per_second = 0;
        let server = test_server(config).await;
        let addr: SocketAddr = "198.51.100.4:5000".parse().unwrap();

        let request = || {
            get_as("/v1/sync/etag", "u1")
                .extension(ConnectInfo(addr))
                .body(Body::empty())
                .unwrap()
        };

        let first = send(&server, request()).await;
        assert_eq!(first.headers()[LIMIT_HEADER], "2");
        assert_eq!(first.headers()[REMAINING_HEADER], "1");

        send(&server, request()).await;
        let rejected = send(&server, request()).await;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()[REMAINING_HEADER], "0");
        assert_eq!(rejected.headers()[RETRY_AFTER], "60");

        // A different principal has its own window.
        let other = send(
            &server,
            get_as("/v1/sync/etag", "u2").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(other.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_is_not_rate_limited() {
        let mut config = Config::default();
        config.limits.threshold = 1;
        let server = test_server(config).await;
        for _ in 0..3 {
            let response = send(
                &server,
                Request::builder().uri("/health").body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(LIMIT_HEADER).is_none());
        }
    }
}
