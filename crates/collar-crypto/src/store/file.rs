//! One-file-per-record storage on the local filesystem.
//!
//! Layout under the root directory:
//!
//! ```text
//! identity_key_pair
//! registration_id
//! next_prekey_id
//! prekeys/<id>
//! signed_prekeys/<id>
//! sessions/n<hex(name)>/<device_id>
//! identities/n<hex(name)>/<device_id>
//! ```
//!
//! Peer directories carry an `n` prefix so that no name, including the empty
//! one, maps onto the family directory itself.
//!
//! Every file is an envelope:
//! [CKSR magic(4)] [version(1)] [length(4)] [payload] [sha256(payload)(32)].
//! Writes go to a uniquely named temporary file in the same directory that is
//! synced and renamed into place, so readers only ever see a complete previous
//! or complete new record, even with several stores open on one root.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::warn;

use super::record::{AddressKind, RecordKey};
use super::storage::RecordStorage;
use crate::error::{KeyNamespace, StoreError};

const MAGIC: &[u8; 4] = b"CKSR"; // "Collar Key Store Record"
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1 + 4;
const DIGEST_LEN: usize = 32;

const PREKEY_DIR: &str = "prekeys";
const SIGNED_PREKEY_DIR: &str = "signed_prekeys";
const SESSION_DIR: &str = "sessions";
const IDENTITY_DIR: &str = "identities";

/// Wrap a record payload in a checksummed envelope.
fn seal(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    data.extend_from_slice(MAGIC);
    data.push(VERSION);
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(payload);
    data.extend_from_slice(&Sha256::digest(payload));
    data
}

/// Validate an envelope and return its payload.
fn unseal(key: &RecordKey, data: &[u8]) -> Result<Vec<u8>, StoreError> {
    if data.len() < HEADER_LEN + DIGEST_LEN {
        return Err(StoreError::corrupt(key, "file too short"));
    }
    if &data[0..4] != MAGIC {
        return Err(StoreError::corrupt(key, "invalid file format (expected CKSR header)"));
    }
    if data[4] != VERSION {
        return Err(StoreError::corrupt(
            key,
            format!("unsupported record version {}", data[4]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[5..9]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if data.len() != HEADER_LEN + payload_len + DIGEST_LEN {
        return Err(StoreError::corrupt(key, "file truncated or padded"));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
    let digest = &data[HEADER_LEN + payload_len..];
    if Sha256::digest(payload).as_slice() != digest {
        return Err(StoreError::corrupt(key, "checksum mismatch"));
    }

    Ok(payload.to_vec())
}

/// Filesystem-backed [`RecordStorage`] rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &RecordKey) -> PathBuf {
        match key {
            RecordKey::IdentityKeyPair => self.root.join("identity_key_pair"),
            RecordKey::RegistrationId => self.root.join("registration_id"),
            RecordKey::NextPreKeyId => self.root.join("next_prekey_id"),
            RecordKey::PreKey(id) => self.root.join(PREKEY_DIR).join(id.to_string()),
            RecordKey::SignedPreKey(id) => self.root.join(SIGNED_PREKEY_DIR).join(id.to_string()),
            RecordKey::Session { name, device_id } => self
                .address_dir(AddressKind::Session, name)
                .join(device_id.to_string()),
            RecordKey::TrustedIdentity { name, device_id } => self
                .address_dir(AddressKind::TrustedIdentity, name)
                .join(device_id.to_string()),
        }
    }

    fn address_dir(&self, kind: AddressKind, name: &str) -> PathBuf {
        let family = match kind {
            AddressKind::Session => SESSION_DIR,
            AddressKind::TrustedIdentity => IDENTITY_DIR,
        };
        self.root
            .join(family)
            .join(format!("n{}", hex::encode(name.as_bytes())))
    }

    /// Numeric file names in `dir`, ascending. Missing directory means none.
    fn numeric_entries(dir: &Path) -> Result<Vec<u32>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            // Leftover `.tmp` files and anything else non-numeric are skipped.
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Make a completed rename durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

// Directories cannot be opened for syncing on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

impl RecordStorage for FileStorage {
    fn load(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => unseal(key, &data).map(Some).inspect_err(|e| {
                warn!(path = %path.display(), error = %e, "rejecting corrupt record");
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn save(&self, key: &RecordKey, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
        tmp.write_all(&seal(bytes))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        sync_dir(parent)
    }

    fn remove(&self, key: &RecordKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn contains(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        path.try_exists().map_err(|e| StoreError::io(path, e))
    }

    fn list_ids(&self, namespace: KeyNamespace) -> Result<Vec<u32>, StoreError> {
        let dir = match namespace {
            KeyNamespace::PreKey => PREKEY_DIR,
            KeyNamespace::SignedPreKey => SIGNED_PREKEY_DIR,
        };
        Self::numeric_entries(&self.root.join(dir))
    }

    fn list_devices(&self, kind: AddressKind, name: &str) -> Result<Vec<u32>, StoreError> {
        Self::numeric_entries(&self.address_dir(kind, name))
    }
}
