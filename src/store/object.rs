//! Content-addressed object identifiers.
//!
//! Objects are keyed by the SHA256 of their bytes and stored under a
//! two-hex-character fan-out directory, e.g. `objects/ab/cdef…`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{FlatpodError, Result};

/// SHA256 object id, stored as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Compute the id of a blob of data.
    pub fn for_bytes(data: &[u8]) -> Self {
        ObjectId(hex::encode(Sha256::digest(data)))
    }

    /// Parse an id from its hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FlatpodError::Repo(format!("malformed object id '{}'", s)));
        }
        Ok(ObjectId(s.to_ascii_lowercase()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Path of the object relative to the objects directory.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.0[..2]).join(&self.0[2..])
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
