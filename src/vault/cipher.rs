//! ChaCha20-Poly1305 sealing of credential blobs
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use super::error::VaultError;

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// Generate a fresh random key from the OS RNG
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    key
}

/// Encrypt `plaintext` under `key` with a random nonce
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::EncryptionFailed)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt and authenticate a blob produced by [`seal`]
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::DecryptionFailed(
            "ciphertext shorter than nonce and tag".to_string(),
        ));
    }

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| VaultError::DecryptionFailed("invalid key length".to_string()))?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::DecryptionFailed("authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let sealed = seal(&key, b"hunter2").unwrap();

        assert_eq!(sealed.len(), NONCE_LEN + 7 + TAG_LEN);
        assert_eq!(open(&key, &sealed).unwrap().as_slice(), b"hunter2");
    }

    #[test]
    fn test_nonce_is_random() {
        let key = generate_key();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&generate_key(), b"secret").unwrap();
        let result = open(&generate_key(), &sealed);
        assert!(matches!(result, Err(VaultError::DecryptionFailed(_))));
    }

    #[test]
    fn test_tamper_detection() {
        let key = generate_key();
        let mut sealed = seal(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn test_truncated_input() {
        let key = generate_key();
        assert!(open(&key, &[0u8; NONCE_LEN]).is_err());
    }
}
