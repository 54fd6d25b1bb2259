//! Short, URL-safe correlation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alphabet used to render identifiers: digits and letters minus the
/// visually ambiguous `0`, `1`, `I`, `O` and `l`.
const ALPHABET: &[u8; 57] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Number of base57 digits needed to hold any 128-bit value.
const ENCODED_LEN: usize = 22;

/// Opaque identifier tying a database statement to its originator.
///
/// Identifiers minted by [`CorrelationId::new`] are 22 characters of base57
/// derived from a random UUID. Identifiers handed over by a web or job
/// framework are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh identifier from 128 bits of OS randomness.
    pub fn new() -> Self {
        Self(encode_base57(Uuid::new_v4().as_u128()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl PartialEq<str> for CorrelationId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CorrelationId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Render `value` most-significant digit first, left-padded to a fixed width.
fn encode_base57(mut value: u128) -> String {
    let base = ALPHABET.len() as u128;
    let mut digits = [ALPHABET[0]; ENCODED_LEN];
    let mut pos = ENCODED_LEN;
    while value > 0 {
        pos -= 1;
        digits[pos] = ALPHABET[(value % base) as usize];
        value /= base;
    }
    digits.iter().map(|&b| b as char).collect()
}
