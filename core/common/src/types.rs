//! Common types used throughout fieldsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Shared secret used to sign remote requests.
///
/// The value is zeroized on drop and never printed by `Debug`.
#[derive(Clone, Default, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    /// Wrap a secret value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Get the secret as bytes, e.g. for use as an HMAC key.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {} bytes])", self.0.len())
    }
}

/// Local row id of a survey instance.
///
/// Responses and transmissions are keyed by this id rather than by the
/// instance uuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub i64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local row id of a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransmissionId(pub i64);

impl fmt::Display for TransmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_redacted() {
        let key = SecretKey::new("very-secret");
        let printed = format!("{:?}", key);
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("11 bytes"));
    }

    #[test]
    fn test_secret_key_bytes() {
        let key = SecretKey::new("abc");
        assert_eq!(key.as_bytes(), b"abc");
        assert!(!key.is_empty());
        assert!(SecretKey::new("").is_empty());
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(InstanceId(42).to_string(), "42");
        assert_eq!(TransmissionId(7).to_string(), "7");
    }
}
