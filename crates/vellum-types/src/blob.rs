use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Domain tag mixed into every blob hash.
const BLOB_DOMAIN: &str = "vellum-blob-v1";

/// Content-addressed identifier of an immutable byte buffer.
///
/// A `BlobId` is the domain-separated BLAKE3 hash of the buffer. Identical
/// content always produces the same id, so blobs are shared between every
/// partition and media that reference the same bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Compute the id of a buffer.
    pub fn for_content(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(BLOB_DOMAIN.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a `BlobId` from a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns `true` if `data` hashes to this id.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::for_content(data) == *self
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.short_hex())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for BlobId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.to_hex()
    }
}
