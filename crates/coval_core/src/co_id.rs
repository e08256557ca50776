//! Co-value identification.

use crate::error::{CovalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base58btc alphabet used for the id suffix (multibase `z` prefix).
const ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Canonical envelope magic bytes for content-derived ids.
const MAGIC: &[u8; 6] = b"COVAL1";

/// A content-addressed co-value identifier.
///
/// Co-ids are printable strings of the form `co_z` followed by a non-empty
/// alphanumeric suffix. The same content always produces the same id, and
/// the shape check is used throughout the engine to detect references
/// embedded in records.
///
/// # Examples
///
/// ```
/// use coval_core::CoId;
///
/// let id = CoId::parse("co_zAbc123").unwrap();
/// assert_eq!(id.as_str(), "co_zAbc123");
/// assert!(CoId::looks_like("co_zAbc123"));
/// assert!(!CoId::looks_like("uuid-1234"));
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoId(String);

impl CoId {
    /// The distinguishing id prefix.
    pub const PREFIX: &'static str = "co_z";

    /// Checks whether a string has the co-id shape without allocating.
    ///
    /// The shape is `co_z` followed by at least one ASCII alphanumeric
    /// character, with no other characters permitted.
    pub fn looks_like(s: &str) -> bool {
        match s.strip_prefix(Self::PREFIX) {
            Some(suffix) => {
                !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
            }
            None => false,
        }
    }

    /// Parses a co-id, validating the prefix and suffix alphabet.
    ///
    /// # Errors
    ///
    /// Returns `CovalError::InvalidId` if the string does not have the
    /// co-id shape.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if !Self::looks_like(s) {
            return Err(CovalError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Computes the co-id for a canonical content payload.
    ///
    /// The payload is wrapped in a fixed envelope (magic + length + bytes),
    /// hashed with BLAKE3, and the hash is base58-encoded into the suffix.
    pub fn from_content(payload: &[u8]) -> Self {
        let mut canonical = Vec::with_capacity(MAGIC.len() + 8 + payload.len());
        canonical.extend_from_slice(MAGIC);
        canonical.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        canonical.extend_from_slice(payload);

        let hash = blake3::hash(&canonical);
        let mut id = String::with_capacity(Self::PREFIX.len() + 44);
        id.push_str(Self::PREFIX);
        id.push_str(&base58(hash.as_bytes()));
        Self(id)
    }

    /// Extracts a co-id from a JSON value if it is a string with the id shape.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value
            .as_str()
            .filter(|s| Self::looks_like(s))
            .map(|s| Self(s.to_string()))
    }
}

impl TryFrom<String> for CoId {
    type Error = CovalError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CoId> for String {
    fn from(id: CoId) -> Self {
        id.0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(Self::PREFIX.len() + 8);
        write!(f, "CoId({}...)", &self.0[..shown])
    }
}

/// Base58btc-encodes a byte slice.
fn base58(bytes: &[u8]) -> String {
    // Repeated division over a little-endian digit buffer.
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    // Leading zero bytes map to leading '1' digits.
    for &byte in bytes {
        if byte != 0 {
            break;
        }
        digits.push(0);
    }

    digits
        .iter()
        .rev()
        .map(|&d| ALPHABET[d as usize] as char)
        .collect()
}
