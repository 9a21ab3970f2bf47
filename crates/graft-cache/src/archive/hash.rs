//! Revision content hashing using Blake3

use blake3::Hasher;
use graft_core::error::GraftError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Blake3 hash of one revision's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    bytes: [u8; 32],
}

impl ContentHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Convert hash to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse a hash from its hexadecimal form
    pub fn from_hex(hex_str: &str) -> Result<Self, GraftError> {
        let bytes = hex::decode(hex_str).map_err(|e| GraftError::IntegrityFailure {
            bundle: "hash".to_string(),
            expected: "valid hex string".to_string(),
            actual: format!("invalid hex: {}", e),
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            GraftError::IntegrityFailure {
                bundle: "hash".to_string(),
                expected: "32 bytes".to_string(),
                actual: format!("{} bytes", bytes.len()),
            }
        })?;
        Ok(Self { bytes })
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = GraftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

/// Compute the Blake3 hash of revision content
pub fn compute_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.update(content);
    ContentHash::new(*hasher.finalize().as_bytes())
}
