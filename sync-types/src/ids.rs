//! Identity and versioning types for profile-sync.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IdError;

/// Maximum length of an owner key in bytes.
pub const MAX_OWNER_KEY_LEN: usize = 256;

/// Maximum length of a profile identifier in bytes.
pub const MAX_PROFILE_ID_LEN: usize = 128;

/// The key of the account that owns a sync record or profile identifier.
///
/// Supplied by the authentication layer. Must be non-empty and free of
/// control characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerKey(String);

impl OwnerKey {
    /// Validate and wrap an owner key.
    pub fn new(key: impl Into<String>) -> Result<Self, IdError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(IdError::EmptyOwnerKey);
        }
        if key.len() > MAX_OWNER_KEY_LEN {
            return Err(IdError::TooLong {
                field: "owner key",
                len: key.len(),
                max: MAX_OWNER_KEY_LEN,
            });
        }
        if key.chars().any(char::is_control) {
            return Err(IdError::InvalidCharacters { field: "owner key" });
        }
        Ok(Self(key))
    }

    /// Get the owner key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OwnerKey {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OwnerKey> for String {
    fn from(key: OwnerKey) -> Self {
        key.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerKey({})", self.0)
    }
}

/// An opaque version token for a sync record.
///
/// Regenerated on every successful write. Two ETags are equal only if they
/// name the same version; an ETag says nothing about content.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    /// Generate a fresh, never-before-seen ETag.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an ETag received from a client or read from storage.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the ETag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ETag({})", self.0)
    }
}

/// A per-session profile identifier.
///
/// 32 bytes of random data, displayed as URL-safe base64.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a new random ProfileId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Validate and wrap an identifier received from a client or storage.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(IdError::EmptyIdentifier);
        }
        if value.len() > MAX_PROFILE_ID_LEN {
            return Err(IdError::TooLong {
                field: "profile identifier",
                len: value.len(),
                max: MAX_PROFILE_ID_LEN,
            });
        }
        if value.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(IdError::InvalidCharacters {
                field: "profile identifier",
            });
        }
        Ok(Self(value))
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProfileId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "ProfileId({short})")
    }
}
