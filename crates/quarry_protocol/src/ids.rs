//! Upload and entry identifiers.
//!
//! Upload ids are opaque 22-character URL-safe tokens (base64url-encoded
//! UUIDv4 bytes, unpadded). Entry ids are derived deterministically from
//! `(upload_id, mainfile)`, so renaming a mainfile creates a new entry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Length of an upload id token.
pub const UPLOAD_ID_LEN: usize = 22;

/// Length of a derived entry id.
pub const ENTRY_ID_LEN: usize = 28;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),
    #[error("invalid entry id: {0}")]
    InvalidEntryId(String),
}

fn is_urlsafe(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Canonical upload identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    /// Generate a fresh 22-character URL-safe token.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(URL_SAFE_NO_PAD.encode(uuid.as_bytes()))
    }

    pub fn parse(value: &str) -> Result<Self, IdError> {
        if value.len() != UPLOAD_ID_LEN || !is_urlsafe(value) {
            return Err(IdError::InvalidUploadId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` characters, used to shard huge filesystems.
    pub fn prefix(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical entry identifier, derived via [`generate_entry_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn parse(value: &str) -> Result<Self, IdError> {
        if value.len() != ENTRY_ID_LEN || !is_urlsafe(value) {
            return Err(IdError::InvalidEntryId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Derive the entry id for a mainfile within an upload.
///
/// The id is a pure function of its inputs: the first 28 characters of the
/// unpadded base64url SHA-512 of `upload_id` and the mainfile path.
pub fn generate_entry_id(upload_id: &UploadId, mainfile: &str) -> EntryId {
    let mut hasher = Sha512::new();
    hasher.update(upload_id.as_str().as_bytes());
    hasher.update(mainfile.as_bytes());
    let digest = hasher.finalize();
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    EntryId(encoded[..ENTRY_ID_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_shape() {
        let id = UploadId::generate();
        assert_eq!(id.as_str().len(), UPLOAD_ID_LEN);
        assert!(is_urlsafe(id.as_str()));
        assert_eq!(UploadId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_upload_id_rejects_garbage() {
        assert!(UploadId::parse("short").is_err());
        assert!(UploadId::parse("has/slash_has/slash_ab").is_err());
        assert!(UploadId::parse("").is_err());
    }

    #[test]
    fn test_entry_id_is_deterministic() {
        let upload_id = UploadId::parse("AAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let a = generate_entry_id(&upload_id, "a/template.json");
        let b = generate_entry_id(&upload_id, "a/template.json");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ENTRY_ID_LEN);
    }

    #[test]
    fn test_entry_id_depends_on_mainfile() {
        let upload_id = UploadId::generate();
        let a = generate_entry_id(&upload_id, "a/template.json");
        let b = generate_entry_id(&upload_id, "b/template.json");
        assert_ne!(a, b, "renamed mainfile must produce a new entry id");
    }

    #[test]
    fn test_entry_id_depends_on_upload() {
        let a = generate_entry_id(&UploadId::generate(), "template.json");
        let b = generate_entry_id(&UploadId::generate(), "template.json");
        assert_ne!(a, b);
    }

    #[test]
    fn test_prefix_sharding() {
        let id = UploadId::parse("AbCdEfGhIjKlMnOpQrStUv").unwrap();
        assert_eq!(id.prefix(2), "Ab");
        assert_eq!(id.prefix(0), "");
        assert_eq!(id.prefix(99), id.as_str());
    }
}
