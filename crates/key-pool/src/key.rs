//! Opaque random key identifiers

use std::borrow::Borrow;
use std::fmt;

use rand::RngExt;
use serde::Serialize;

/// Number of random bytes behind each key (128 bits).
const KEY_BYTES: usize = 16;

/// An opaque, randomly generated key rendered as lowercase hex.
///
/// Immutable once generated. Borrows as `&str` so pool lookups can use the
/// raw value taken from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Generate a fresh key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        rand::rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value)
    }
}
