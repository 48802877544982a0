//! Credential Vault
//!
//! Versioned symmetric keys for the credentials stored in the server registry.
//!
//! # Layout
//!
//! - `keystore`: key versions and the on-disk key file
//! - `cipher`: ChaCha20-Poly1305 sealing
//! - `secret`: the `v<N>:<ciphertext>` credential format
//! - `credential`: [`CredentialVault`], the encrypt/decrypt/rotate API
//! - `rotation`: re-encryption of registry rows after a key rotation

pub mod cipher;
pub mod credential;
pub mod error;
pub mod keystore;
pub mod rotation;
pub mod secret;

pub use credential::CredentialVault;
pub use error::{RotationError, VaultError};
pub use keystore::{InvalidKeyVersion, KeyStore, KeyVersion};
pub use rotation::{RotationOrchestrator, RotationReport, SkippedRow};
pub use secret::{EncryptedSecret, SecretParts};
