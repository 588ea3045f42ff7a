//! # sync-types
//!
//! Shared identity types for profile-sync.
//!
//! - [`OwnerKey`] - the account a sync record or profile belongs to
//! - [`ETag`] - opaque version token for a sync record
//! - [`ProfileId`] - per-session profile identifier
//! - [`IdError`] - validation errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;

pub use error::IdError;
pub use ids::{ETag, OwnerKey, ProfileId, MAX_OWNER_KEY_LEN, MAX_PROFILE_ID_LEN};
