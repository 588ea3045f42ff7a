//! # profile-sync-server
//!
//! Backend that lets a client push and pull one opaque blob per account with
//! optimistic concurrency, while tracking a per-session profile identifier
//! and guarding its endpoints with a shared rate limiter.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum) ──► rate limit middleware ──► handlers
//!                        │                      │
//!                   RateLimiter          SyncCoordinator ──► BlobStore
//!                        │                      │
//!                        │             IdentityLifecycle ──► IdentifierStore
//!                        ▼                      │               AccountDirectory
//!                  EphemeralStore ◄─────────────┘
//!
//!   CleanupJob (own task) ──► IdentityLifecycle
//! ```
//!
//! ## Protocol
//!
//! - `GET /v1/sync` honours `If-None-Match` (304 on match, 404 when empty)
//! - `PUT /v1/sync` honours `If-Match` (412 on mismatch) and returns the new `ETag`
//! - `GET /v1/profile` returns the caller's current profile identifier

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod ephemeral;
pub mod error;
pub mod http;
pub mod identity;
pub mod limits;
pub mod reload;
pub mod server;
pub mod storage;
