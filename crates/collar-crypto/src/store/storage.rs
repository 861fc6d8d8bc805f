//! Byte-level record persistence underneath the [`KeyStore`](super::KeyStore).
//!
//! Backends store opaque blobs keyed by [`RecordKey`] and know nothing about
//! what the bytes mean. The trait is synchronous; callers may block on I/O.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::record::{AddressKind, RecordKey};
use crate::error::{KeyNamespace, StoreError};

/// Durable home for key store records.
///
/// Implementations must be safe to call from many threads at once. They do
/// not need to serialize access to a single key; the key store does that.
pub trait RecordStorage: Send + Sync {
    /// Load a record. `None` if it was never saved or has been removed.
    fn load(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Save a record, replacing any previous value.
    fn save(&self, key: &RecordKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Remove a record. Removing an absent record is not an error.
    fn remove(&self, key: &RecordKey) -> Result<(), StoreError>;

    fn contains(&self, key: &RecordKey) -> Result<bool, StoreError> {
        Ok(self.load(key)?.is_some())
    }

    /// Ids stored in a key namespace, ascending.
    fn list_ids(&self, namespace: KeyNamespace) -> Result<Vec<u32>, StoreError>;

    /// Device ids with a record of `kind` under `name`, ascending.
    fn list_devices(&self, kind: AddressKind, name: &str) -> Result<Vec<u32>, StoreError>;
}

/// In-memory storage for tests and throwaway stores.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<RecordKey, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted<F>(&self, select: F) -> Vec<u32>
    where
        F: Fn(&RecordKey) -> Option<u32>,
    {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<u32> = records.keys().filter_map(select).collect();
        ids.sort_unstable();
        ids
    }
}

impl RecordStorage for MemoryStorage {
    fn load(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    fn save(&self, key: &RecordKey, bytes: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &RecordKey) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
        Ok(())
    }

    fn list_ids(&self, namespace: KeyNamespace) -> Result<Vec<u32>, StoreError> {
        Ok(self.collect_sorted(|key| match (namespace, key) {
            (KeyNamespace::PreKey, RecordKey::PreKey(id))
            | (KeyNamespace::SignedPreKey, RecordKey::SignedPreKey(id)) => Some(*id),
            _ => None,
        }))
    }

    fn list_devices(&self, kind: AddressKind, name: &str) -> Result<Vec<u32>, StoreError> {
        Ok(self.collect_sorted(|key| match (kind, key) {
            (AddressKind::Session, RecordKey::Session { name: n, device_id })
            | (AddressKind::TrustedIdentity, RecordKey::TrustedIdentity { name: n, device_id })
                if n == name =>
            {
                Some(*device_id)
            }
            _ => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_do_not_collide() {
        let storage = MemoryStorage::new();
        storage.save(&RecordKey::PreKey(7), b"pre").unwrap();

        assert_eq!(storage.list_ids(KeyNamespace::PreKey).unwrap(), vec![7]);
        assert!(storage.list_ids(KeyNamespace::SignedPreKey).unwrap().is_empty());
        assert!(storage.load(&RecordKey::SignedPreKey(7)).unwrap().is_none());
    }

    #[test]
    fn devices_are_sorted_and_scoped_by_name_and_kind() {
        let storage = MemoryStorage::new();
        for device in [3, 1, 2] {
            storage
                .save(&RecordKey::address(AddressKind::Session, "k", device), b"s")
                .unwrap();
        }
        storage
            .save(&RecordKey::address(AddressKind::Session, "other", 9), b"s")
            .unwrap();
        storage
            .save(&RecordKey::address(AddressKind::TrustedIdentity, "k", 5), b"i")
            .unwrap();

        assert_eq!(
            storage.list_devices(AddressKind::Session, "k").unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            storage.list_devices(AddressKind::TrustedIdentity, "k").unwrap(),
            vec![5]
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.remove(&RecordKey::PreKey(1)).unwrap();
        storage.save(&RecordKey::PreKey(1), b"x").unwrap();
        storage.remove(&RecordKey::PreKey(1)).unwrap();
        storage.remove(&RecordKey::PreKey(1)).unwrap();
        assert!(storage.records.lock().unwrap().is_empty());
    }
}
