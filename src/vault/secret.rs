//! Encrypted credential blobs
//!
//! A secret is either `v<N>:<sealed bytes>` or, for rows written before key
//! versioning existed, bare sealed bytes ("legacy").

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::keystore::{KeyVersion, MAX_VERSION_LEN};

/// Opaque encrypted credential as stored by the registry
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSecret(Vec<u8>);

/// Parsed view of an [`EncryptedSecret`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretParts<'a> {
    Versioned {
        version: KeyVersion,
        ciphertext: &'a [u8],
    },
    Legacy(&'a [u8]),
}

impl EncryptedSecret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub(crate) fn versioned(version: KeyVersion, sealed: &[u8]) -> Self {
        let label = version.to_string();
        let mut bytes = Vec::with_capacity(label.len() + 1 + sealed.len());
        bytes.extend_from_slice(label.as_bytes());
        bytes.push(b':');
        bytes.extend_from_slice(sealed);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Split off the version prefix, if the blob carries a well-formed one.
    ///
    /// Only the first `:` within the first few bytes counts, so random legacy
    /// ciphertext that contains a colon later on still parses as legacy.
    pub fn split(&self) -> SecretParts<'_> {
        let window = &self.0[..self.0.len().min(MAX_VERSION_LEN + 1)];
        if let Some(colon) = window.iter().position(|b| *b == b':') {
            let version = std::str::from_utf8(&self.0[..colon])
                .ok()
                .and_then(|label| label.parse::<KeyVersion>().ok());
            if let Some(version) = version {
                return SecretParts::Versioned {
                    version,
                    ciphertext: &self.0[colon + 1..],
                };
            }
        }
        SecretParts::Legacy(&self.0)
    }

    /// Version named by the prefix, `None` for legacy blobs
    pub fn version(&self) -> Option<KeyVersion> {
        match self.split() {
            SecretParts::Versioned { version, .. } => Some(version),
            SecretParts::Legacy(_) => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version().is_none()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded.trim()).map(Self)
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version() {
            Some(v) => write!(f, "EncryptedSecret({}, {} bytes)", v, self.0.len()),
            None => write!(f, "EncryptedSecret(legacy, {} bytes)", self.0.len()),
        }
    }
}

impl Serialize for EncryptedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncryptedSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_versioned() {
        let secret = EncryptedSecret::from_bytes(b"v3:\x01\x02:\x03".to_vec());
        match secret.split() {
            SecretParts::Versioned {
                version,
                ciphertext,
            } => {
                assert_eq!(version.number(), 3);
                assert_eq!(ciphertext, b"\x01\x02:\x03");
            }
            other => panic!("Expected versioned, got {:?}", other),
        }
    }

    #[test]
    fn test_split_legacy() {
        assert!(EncryptedSecret::from_bytes(b"\x9a\x01\x02".to_vec()).is_legacy());
        // Colon too far in to be a version prefix
        assert!(EncryptedSecret::from_bytes(b"abcdefghijklmnop:xyz".to_vec()).is_legacy());
        // Colon early, but not a version label
        assert!(EncryptedSecret::from_bytes(b"x1:abc".to_vec()).is_legacy());
        assert!(EncryptedSecret::from_bytes(Vec::new()).is_legacy());
    }

    #[test]
    fn test_serde_is_base64() {
        let secret = EncryptedSecret::from_bytes(b"v1:abc".to_vec());
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, format!("\"{}\"", BASE64.encode(b"v1:abc")));

        let back: EncryptedSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, secret);
    }

    #[test]
    fn test_debug_hides_bytes() {
        let secret = EncryptedSecret::from_bytes(b"v2:topsecret".to_vec());
        let shown = format!("{:?}", secret);
        assert!(!shown.contains("topsecret"));
        assert!(shown.contains("v2"));
    }
}
