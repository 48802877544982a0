//! OpenSSH `known_hosts` store
//!
//! Hosts on port 22 are identified as `host`, others as `[host]:port`, the
//! way OpenSSH writes them, so a key trusted for one port says nothing about
//! another. Hashed and marker lines are ignored.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    /// Host not recorded, or recorded only with other key algorithms
    Unknown { fingerprint: String },
    /// A different key of the same algorithm is recorded
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StoredKey {
    algorithm: String,
    blob: Vec<u8>,
}

/// `host` for port 22, `[host]:port` otherwise
fn host_id(host: &str, port: u16) -> String {
    match port {
        22 => host.to_ascii_lowercase(),
        port => format!("[{}]:{}", host.to_ascii_lowercase(), port),
    }
}

/// Host id for one comma-separated name from a host field
fn host_id_from_field(name: &str) -> String {
    let Some(inner) = name.strip_prefix('[') else {
        return name.to_ascii_lowercase();
    };
    match inner.split_once("]:").map(|(h, p)| (h, p.parse::<u16>())) {
        Some((host, Ok(port))) => host_id(host, port),
        _ => inner.trim_end_matches(']').to_ascii_lowercase(),
    }
}

/// `hosts algorithm base64 [comment]` into host ids and the key
fn parse_line(line: &str) -> Option<(Vec<String>, StoredKey)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let (hosts, algorithm, encoded) = (fields.next()?, fields.next()?, fields.next()?);
    let blob = BASE64.decode(encoded).ok()?;

    let ids: Vec<String> = hosts
        .split(',')
        .filter(|name| !name.starts_with('|'))
        .map(host_id_from_field)
        .collect();
    if ids.is_empty() {
        return None;
    }

    Some((
        ids,
        StoredKey {
            algorithm: algorithm.to_string(),
            blob,
        },
    ))
}

fn fingerprint_of(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", BASE64.encode(digest).trim_end_matches('='))
}

pub struct KnownHostsStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, Vec<StoredKey>>>,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".ssh")
            .join("known_hosts")
    }

    /// Open the store at `path`; a missing or unreadable file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let keys = match fs::read_to_string(&path) {
            Ok(text) => {
                let mut keys: HashMap<String, Vec<StoredKey>> = HashMap::new();
                for (ids, key) in text.lines().filter_map(parse_line) {
                    for id in ids {
                        keys.entry(id).or_default().push(key.clone());
                    }
                }
                info!("Loaded known_hosts {:?} ({} hosts)", path, keys.len());
                keys
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No known_hosts file at {:?}", path);
                HashMap::new()
            }
            Err(e) => {
                warn!("Failed to read known_hosts {:?}: {}", path, e);
                HashMap::new()
            }
        };

        Self {
            path,
            keys: RwLock::new(keys),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA256 fingerprint in OpenSSH display form
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_of(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let id = host_id(host, port);
        let presented = StoredKey {
            algorithm: key.algorithm().as_str().to_string(),
            blob: key.public_key_bytes(),
        };

        let keys = self.keys.read();
        let same_algorithm: Vec<&StoredKey> = keys
            .get(&id)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|k| k.algorithm == presented.algorithm)
                    .collect()
            })
            .unwrap_or_default();

        if same_algorithm.contains(&&presented) {
            debug!("Host key verified for {} ({})", id, presented.algorithm);
            return HostKeyVerification::Verified;
        }

        let actual_fingerprint = fingerprint_of(&presented.blob);
        match same_algorithm.first() {
            Some(expected) => HostKeyVerification::Changed {
                expected_fingerprint: fingerprint_of(&expected.blob),
                actual_fingerprint,
            },
            None => {
                debug!("No {} key recorded for {}", presented.algorithm, id);
                HostKeyVerification::Unknown {
                    fingerprint: actual_fingerprint,
                }
            }
        }
    }

    /// Trust `key` for `host:port` and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let id = host_id(host, port);
        let stored = StoredKey {
            algorithm: key.algorithm().as_str().to_string(),
            blob: key.public_key_bytes(),
        };
        let line = format!("{} {} {}", id, stored.algorithm, BASE64.encode(&stored.blob));

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;

        info!("Trusted new {} host key for {}", stored.algorithm, id);
        self.keys.write().entry(id).or_default().push(stored);
        Ok(())
    }
}
