//! Versioned encryption key store
//!
//! On-disk format (JSON, owner-only permissions):
//!
//! ```text
//! { "primary_key": "v2", "keys": { "v1": "<base64>", "v2": "<base64>" } }
//! ```
//!
//! Keys are never removed: every version that ever encrypted a credential must
//! stay available for decryption.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::cipher::{generate_key, KEY_LEN};
use super::error::VaultError;

/// Longest accepted version label (`v` + 9 digits)
pub(crate) const MAX_VERSION_LEN: usize = 10;

/// Key generation identifier, rendered as `v<N>`
///
/// Ordered numerically, so `v10` sorts after `v9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyVersion(u32);

impl KeyVersion {
    pub const FIRST: KeyVersion = KeyVersion(1);

    pub fn new(number: u32) -> Option<Self> {
        (number > 0).then_some(Self(number))
    }

    pub fn number(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key version label: {0:?}")]
pub struct InvalidKeyVersion(pub String);

impl FromStr for KeyVersion {
    type Err = InvalidKeyVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidKeyVersion(s.to_string());

        if s.len() > MAX_VERSION_LEN {
            return Err(invalid());
        }
        let digits = s.strip_prefix('v').ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        digits
            .parse::<u32>()
            .ok()
            .and_then(KeyVersion::new)
            .ok_or_else(invalid)
    }
}

/// Serialized form of the key file
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    primary_key: String,
    keys: BTreeMap<String, String>,
}

/// In-memory key set with a designated primary
#[derive(Clone)]
pub struct KeyStore {
    primary: KeyVersion,
    keys: BTreeMap<KeyVersion, Zeroizing<[u8; KEY_LEN]>>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("primary", &self.primary)
            .field("versions", &self.versions())
            .finish()
    }
}

impl KeyStore {
    /// Fresh store holding a single random `v1` key
    pub fn generate() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(KeyVersion::FIRST, generate_key());
        Self {
            primary: KeyVersion::FIRST,
            keys,
        }
    }

    pub fn primary_version(&self) -> KeyVersion {
        self.primary
    }

    pub fn primary_key(&self) -> Option<&[u8; KEY_LEN]> {
        self.key(self.primary)
    }

    pub fn key(&self, version: KeyVersion) -> Option<&[u8; KEY_LEN]> {
        self.keys.get(&version).map(|k| &**k)
    }

    pub fn contains(&self, version: KeyVersion) -> bool {
        self.keys.contains_key(&version)
    }

    /// All versions, oldest first
    pub fn versions(&self) -> Vec<KeyVersion> {
        self.keys.keys().copied().collect()
    }

    /// Keys in trial order for legacy decryption: newest first
    pub fn newest_first(&self) -> impl Iterator<Item = (KeyVersion, &[u8; KEY_LEN])> {
        self.keys.iter().rev().map(|(v, k)| (*v, &**k))
    }

    /// Copy of this store with one freshly generated key set as primary
    pub fn with_new_primary(&self) -> Result<Self, VaultError> {
        let newest = self
            .keys
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.primary);
        let version = newest.next().ok_or(VaultError::VersionExhausted)?;

        let mut rotated = self.clone();
        rotated.keys.insert(version, generate_key());
        rotated.primary = version;
        Ok(rotated)
    }

    /// Union of this store and `other`; the higher primary wins
    ///
    /// Also reports whether `other` held versions missing here. The same
    /// version with different key bytes in both is a `KeyConflict`: one of the
    /// two keys would be lost whichever store is kept.
    pub fn merged_with(&self, other: &KeyStore) -> Result<(KeyStore, bool), VaultError> {
        let mut merged = self.clone();
        let mut added = false;

        for (version, key) in &other.keys {
            match merged.keys.get(version) {
                Some(existing) if **existing != **key => {
                    return Err(VaultError::KeyConflict(*version));
                }
                Some(_) => {}
                None => {
                    merged.keys.insert(*version, key.clone());
                    added = true;
                }
            }
        }
        merged.primary = self.primary.max(other.primary);
        Ok((merged, added))
    }

    /// Read the store at `path`; `Ok(None)` if no file exists
    pub fn read_from(path: &Path) -> Result<Option<Self>, VaultError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::Io(e)),
        };

        let file: KeyFile = serde_json::from_str(&contents)
            .map_err(|e| VaultError::corrupt(path, format!("unparsable JSON: {}", e)))?;

        Self::from_file(path, file).map(Some)
    }

    fn from_file(path: &Path, file: KeyFile) -> Result<Self, VaultError> {
        let primary: KeyVersion = file
            .primary_key
            .parse()
            .map_err(|e: InvalidKeyVersion| VaultError::corrupt(path, e.to_string()))?;

        let mut keys = BTreeMap::new();
        for (label, encoded) in &file.keys {
            let version: KeyVersion = label
                .parse()
                .map_err(|e: InvalidKeyVersion| VaultError::corrupt(path, e.to_string()))?;

            let raw = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
                VaultError::corrupt(path, format!("key {} is not valid base64: {}", label, e))
            })?);
            if raw.len() != KEY_LEN {
                return Err(VaultError::corrupt(
                    path,
                    format!("key {} has {} bytes, expected {}", label, raw.len(), KEY_LEN),
                ));
            }

            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&raw);
            keys.insert(version, key);
        }

        if !keys.contains_key(&primary) {
            return Err(VaultError::corrupt(
                path,
                format!("primary version {} is not in the key map", primary),
            ));
        }

        Ok(Self { primary, keys })
    }

    fn to_file(&self) -> KeyFile {
        KeyFile {
            primary_key: self.primary.to_string(),
            keys: self
                .keys
                .iter()
                .map(|(v, k)| (v.to_string(), BASE64.encode(&**k)))
                .collect(),
        }
    }

    /// Persist atomically: write a 0600 temp file, fsync, then rename over `path`
    pub fn write_to(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = Zeroizing::new(serde_json::to_string_pretty(&self.to_file())?);
        let temp_path = temp_path_for(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        restrict_permissions(path)?;

        debug!("Key store written to {:?} (primary {})", path, self.primary);
        Ok(())
    }
}

/// Load the store at `path`, creating and persisting a fresh `v1` store if absent
///
/// An existing but broken file is an error, never silently replaced.
pub fn load_or_create(path: &Path) -> Result<KeyStore, VaultError> {
    if let Some(store) = KeyStore::read_from(path)? {
        return Ok(store);
    }

    info!("No key store at {:?}, creating one with key v1", path);
    let store = KeyStore::generate();
    store.write_to(path)?;
    Ok(store)
}

/// Exclusive advisory lock on `<key file>.lock`, released on drop
///
/// Every writer of the key file, in this process or another, takes it
/// before reading the file it is about to replace.
pub struct KeyFileLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<fs::File>,
    #[cfg(not(unix))]
    _file: fs::File,
}

/// Block until the key file lock for `path` is ours
pub fn lock_key_file(path: &Path) -> Result<KeyFileLock, VaultError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(sibling_path(path, ".lock"))?;

    #[cfg(unix)]
    {
        use nix::fcntl::{Flock, FlockArg};
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| VaultError::Io(std::io::Error::from(errno)))?;
        Ok(KeyFileLock { _lock: lock })
    }
    #[cfg(not(unix))]
    {
        Ok(KeyFileLock { _file: file })
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    sibling_path(path, ".tmp")
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn restrict_permissions(path: &Path) -> Result<(), VaultError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_version_parse_and_display() {
        assert_eq!("v1".parse::<KeyVersion>().unwrap(), KeyVersion::FIRST);
        assert_eq!("v12".parse::<KeyVersion>().unwrap().number(), 12);
        assert_eq!(KeyVersion::new(7).unwrap().to_string(), "v7");

        for bad in ["", "v", "1", "v0", "v-1", "v+2", "x3", "v1a", "v12345678901"] {
            assert!(bad.parse::<KeyVersion>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_versions_order_numerically() {
        let v9 = KeyVersion::new(9).unwrap();
        let v10 = KeyVersion::new(10).unwrap();
        assert!(v10 > v9);
    }

    #[test]
    fn test_load_or_create_creates_v1() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("var").join("encryption.key");

        let store = load_or_create(&path).unwrap();
        assert_eq!(store.primary_version(), KeyVersion::FIRST);
        assert_eq!(store.versions(), vec![KeyVersion::FIRST]);
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Second load reads the same key back
        let again = load_or_create(&path).unwrap();
        assert_eq!(again.primary_key(), store.primary_key());
    }

    #[test]
    fn test_file_format() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("keys.json");
        let store = KeyStore::generate().with_new_primary().unwrap();
        store.write_to(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["primary_key"], "v2");
        let v1 = value["keys"]["v1"].as_str().unwrap();
        assert_eq!(BASE64.decode(v1).unwrap().len(), KEY_LEN);
        assert!(!temp.path().join("keys.json.tmp").exists());
    }

    #[test]
    fn test_unparsable_file_is_corrupt_and_kept() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("keys.json");
        fs::write(&path, "{ not json").unwrap();

        let result = load_or_create(&path);
        assert!(matches!(result, Err(VaultError::KeyStoreCorrupt { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_missing_primary_is_corrupt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("keys.json");
        let key = BASE64.encode([7u8; KEY_LEN]);
        fs::write(
            &path,
            format!(r#"{{"primary_key": "v2", "keys": {{"v1": "{}"}}}}"#, key),
        )
        .unwrap();

        let err = KeyStore::read_from(&path).unwrap_err();
        match err {
            VaultError::KeyStoreCorrupt { reason, .. } => assert!(reason.contains("v2")),
            other => panic!("Expected KeyStoreCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_short_key_is_corrupt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("keys.json");
        let key = BASE64.encode([7u8; 16]);
        fs::write(
            &path,
            format!(r#"{{"primary_key": "v1", "keys": {{"v1": "{}"}}}}"#, key),
        )
        .unwrap();

        assert!(matches!(
            KeyStore::read_from(&path),
            Err(VaultError::KeyStoreCorrupt { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_every_version() {
        let base = KeyStore::generate();
        let ahead = base.with_new_primary().unwrap().with_new_primary().unwrap();

        let (merged, added) = base.merged_with(&ahead).unwrap();
        assert!(added);
        assert_eq!(merged.primary_version().number(), 3);
        assert_eq!(merged.versions().len(), 3);
        assert_eq!(merged.key(KeyVersion::FIRST), base.key(KeyVersion::FIRST));

        let (same, added) = ahead.merged_with(&base).unwrap();
        assert!(!added);
        assert_eq!(same.primary_version().number(), 3);
    }

    #[test]
    fn test_merge_rejects_diverged_versions() {
        let base = KeyStore::generate();
        let ours = base.with_new_primary().unwrap();
        let theirs = base.with_new_primary().unwrap();

        match ours.merged_with(&theirs) {
            Err(VaultError::KeyConflict(version)) => assert_eq!(version.number(), 2),
            other => panic!("Expected key conflict, got {:?}", other.map(|(s, _)| s)),
        }
    }

    #[test]
    fn test_key_file_lock_is_reentrant_after_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("var").join("encryption.key");

        let first = lock_key_file(&path).unwrap();
        assert!(temp.path().join("var").join("encryption.key.lock").exists());
        drop(first);
        let _second = lock_key_file(&path).unwrap();
    }

    #[test]
    fn test_with_new_primary_keeps_history() {
        let store = KeyStore::generate();
        let rotated = store.with_new_primary().unwrap();

        assert_eq!(rotated.primary_version().number(), 2);
        assert_eq!(rotated.key(KeyVersion::FIRST), store.key(KeyVersion::FIRST));
        assert_ne!(rotated.primary_key(), store.primary_key());

        let order: Vec<_> = rotated.newest_first().map(|(v, _)| v.number()).collect();
        assert_eq!(order, vec![2, 1]);
    }
}
