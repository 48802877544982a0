//! Credential vault: versioned encrypt/decrypt over a persistent key store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::cipher;
use super::error::VaultError;
use super::keystore::{self, KeyStore, KeyVersion};
use super::secret::{EncryptedSecret, SecretParts};

/// Encrypts and decrypts credential blobs with the versioned key store at `path`
///
/// Constructed explicitly and shared by `Arc`. Readers work on a cached
/// snapshot of the key store. Writers hold the in-process `write_lock` and
/// then the key file lock, and always start from the file as it is on disk,
/// so a rotation done by another process is merged rather than overwritten.
pub struct CredentialVault {
    path: PathBuf,
    store: RwLock<Arc<KeyStore>>,
    /// Serializes key file writers within this process
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("path", &self.path)
            .field("primary", &self.primary_version())
            .finish()
    }
}

impl CredentialVault {
    /// Open the key store at `path`, creating a `v1` store if none exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        let store = {
            let _file_lock = keystore::lock_key_file(&path)?;
            keystore::load_or_create(&path)?
        };
        info!(
            "Credential vault opened at {:?} (primary {}, {} keys)",
            path,
            store.primary_version(),
            store.versions().len()
        );

        Ok(Self {
            path,
            store: RwLock::new(Arc::new(store)),
            write_lock: Mutex::new(()),
        })
    }

    /// Re-read the key file and refresh the cached store
    ///
    /// Keys held in memory but missing from the file are written back, so a
    /// deleted or reverted key file never costs a key.
    pub fn load(&self) -> Result<Arc<KeyStore>, VaultError> {
        let _guard = self.write_lock.lock();
        let _file_lock = keystore::lock_key_file(&self.path)?;

        let fresh = Arc::new(self.sync_with_disk()?);
        *self.store.write() = fresh.clone();
        Ok(fresh)
    }

    /// The file's store merged with the cache; both locks must be held
    fn sync_with_disk(&self) -> Result<KeyStore, VaultError> {
        let cached = self.snapshot();
        match KeyStore::read_from(&self.path)? {
            Some(on_disk) => {
                let (merged, restored) = on_disk.merged_with(&cached)?;
                if restored {
                    warn!("Key file {:?} lacks keys held in memory, restoring them", self.path);
                    merged.write_to(&self.path)?;
                }
                Ok(merged)
            }
            None => {
                warn!("Key file {:?} disappeared, rewriting it from memory", self.path);
                cached.write_to(&self.path)?;
                Ok((*cached).clone())
            }
        }
    }

    pub fn snapshot(&self) -> Arc<KeyStore> {
        self.store.read().clone()
    }

    pub fn primary_version(&self) -> KeyVersion {
        self.store.read().primary_version()
    }

    pub fn versions(&self) -> Vec<KeyVersion> {
        self.store.read().versions()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encrypt under the primary key, prefixed with its version
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, VaultError> {
        let store = self.snapshot();
        let key = store.primary_key().ok_or(VaultError::EncryptionFailed)?;
        let sealed = cipher::seal(key, plaintext.as_bytes())?;
        Ok(EncryptedSecret::versioned(store.primary_version(), &sealed))
    }

    /// Decrypt with the cached keys
    ///
    /// A secret naming a version newer than the cached primary was written
    /// after a rotation elsewhere; the key file is re-read once before trying.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<String>, VaultError> {
        let store = self.snapshot();
        if let Some(version) = secret.version() {
            if version > store.primary_version() && !store.contains(version) {
                debug!(
                    "Secret uses key {} newer than cached primary {}, reloading",
                    version,
                    store.primary_version()
                );
                match self.load() {
                    Ok(fresh) => return decrypt_with(&fresh, secret),
                    Err(e) => warn!("Failed to reload key store {:?}: {}", self.path, e),
                }
            }
        }
        decrypt_with(&store, secret)
    }

    /// Mint a new primary key, persist the store, and return its version
    ///
    /// Starts from the key file rather than the cache, so keys minted by
    /// another process are kept and the new version is above all of them.
    /// The in-memory store changes only once the file write has succeeded.
    pub fn rotate(&self) -> Result<KeyVersion, VaultError> {
        let _guard = self.write_lock.lock();
        let _file_lock = keystore::lock_key_file(&self.path)?;

        let current = self.sync_with_disk()?;
        let rotated = current.with_new_primary()?;
        rotated.write_to(&self.path)?;

        let version = rotated.primary_version();
        *self.store.write() = Arc::new(rotated);

        info!(
            "Key rotated: {} -> {} ({:?})",
            current.primary_version(),
            version,
            self.path
        );
        Ok(version)
    }

    /// Whether `secret` should be re-encrypted under the current primary key
    pub fn needs_migration(&self, secret: &EncryptedSecret) -> bool {
        secret.version() != Some(self.primary_version())
    }
}

/// Decrypt `secret` against an explicit key set
///
/// A known version prefix selects its key. A missing prefix, or one naming a
/// version this store does not hold, falls back to trying every key on the
/// whole blob, newest first.
pub(crate) fn decrypt_with(
    store: &KeyStore,
    secret: &EncryptedSecret,
) -> Result<Zeroizing<String>, VaultError> {
    let plaintext = match secret.split() {
        SecretParts::Versioned {
            version,
            ciphertext,
        } => match store.key(version) {
            Some(key) => cipher::open(key, ciphertext)?,
            None => {
                debug!("Secret names unknown key {}, trying legacy decryption", version);
                decrypt_any(store, secret.as_bytes())?
            }
        },
        SecretParts::Legacy(bytes) => decrypt_any(store, bytes)?,
    };

    into_utf8(plaintext)
}

fn decrypt_any(store: &KeyStore, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    for (version, key) in store.newest_first() {
        if let Ok(plaintext) = cipher::open(key, bytes) {
            debug!("Legacy secret decrypted with key {}", version);
            return Ok(plaintext);
        }
    }
    warn!("Secret could not be decrypted with any of {} keys", store.versions().len());
    Err(VaultError::DecryptionFailed(
        "no known key decrypts this secret".to_string(),
    ))
}

fn into_utf8(plaintext: Zeroizing<Vec<u8>>) -> Result<Zeroizing<String>, VaultError> {
    match std::str::from_utf8(&plaintext) {
        Ok(text) => Ok(Zeroizing::new(text.to_string())),
        Err(_) => Err(VaultError::DecryptionFailed(
            "plaintext is not valid UTF-8".to_string(),
        )),
    }
}
