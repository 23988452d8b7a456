//! In-memory secrets store.
//!
//! Holds the threshold ciphertext for each key together with the client and
//! timestamp of the PUT that produced it. Every replica keeps its own copy;
//! the PUT quorum and catch-up are what make the copies converge.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::config::PeerId;
use crate::message::{CatchUpEntry, Timestamp};
use crate::threshold::Ciphertext;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no secret stored under {0:?}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub ciphertext: Ciphertext,
    pub client_id: PeerId,
    pub timestamp: Timestamp,
}

/// Thread-safe map from key to its newest stored secret.
///
/// `BTreeMap` keeps status snapshots and catch-up responses in key order.
#[derive(Default)]
pub struct SecretStore {
    data: Mutex<BTreeMap<String, StoredSecret>>,
}

impl SecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `secret` under `key` unless a newer write is already present.
    ///
    /// Returns whether the store changed. Replaying the same write is a no-op,
    /// so catch-up and late PUT quorums never roll a key backwards.
    pub fn put(&self, key: impl Into<String>, secret: StoredSecret) -> bool {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key.into();
        match data.get(&key) {
            Some(existing) if existing.timestamp >= secret.timestamp => false,
            _ => {
                data.insert(key, secret);
                true
            }
        }
    }

    /// Returns a copy of the entry for `key`, or [`StoreError::NotFound`].
    pub fn get(&self, key: &str) -> Result<StoredSecret, StoreError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest timestamp held for each client that has written to this store.
    pub fn latest_timestamps(&self) -> BTreeMap<PeerId, Timestamp> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut latest = BTreeMap::new();
        for secret in data.values() {
            let entry = latest.entry(secret.client_id).or_insert(secret.timestamp);
            *entry = (*entry).max(secret.timestamp);
        }
        latest
    }

    /// Entries a peer with the given per-client watermarks does not have yet.
    ///
    /// An entry is selected when its timestamp is strictly newer than the
    /// watermark for its client, or when the peer has no watermark for that
    /// client at all.
    pub fn select_newer(&self, known: &BTreeMap<PeerId, Timestamp>) -> Vec<CatchUpEntry> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.iter()
            .filter(|(_, secret)| {
                known
                    .get(&secret.client_id)
                    .map_or(true, |&watermark| secret.timestamp > watermark)
            })
            .map(|(key, secret)| CatchUpEntry {
                key: key.clone(),
                ciphertext: secret.ciphertext.clone(),
                client_id: secret.client_id,
                timestamp: secret.timestamp,
            })
            .collect()
    }

    /// Clones the whole map; used by replica status and tests.
    pub fn snapshot(&self) -> BTreeMap<String, StoredSecret> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8, client_id: PeerId, timestamp: Timestamp) -> StoredSecret {
        StoredSecret {
            ciphertext: Ciphertext {
                u: vec![byte; 48],
                v: vec![byte],
                tag: vec![byte; 16],
            },
            client_id,
            timestamp,
        }
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = SecretStore::new();
        assert_eq!(store.get("alice"), Err(StoreError::NotFound("alice".into())));
        assert!(store.is_empty());
    }

    #[test]
    fn newer_write_wins_and_older_is_ignored() {
        let store = SecretStore::new();
        assert!(store.put("alice", secret(1, 10, 100)));
        assert!(store.put("alice", secret(2, 10, 200)));
        assert!(!store.put("alice", secret(3, 11, 150)));
        assert!(!store.put("alice", secret(2, 10, 200)), "replay is a no-op");
        assert_eq!(store.get("alice"), Ok(secret(2, 10, 200)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn latest_timestamps_track_each_client() {
        let store = SecretStore::new();
        store.put("a", secret(1, 10, 100));
        store.put("b", secret(1, 10, 300));
        store.put("c", secret(1, 11, 50));
        let latest = store.latest_timestamps();
        assert_eq!(latest.get(&10), Some(&300));
        assert_eq!(latest.get(&11), Some(&50));
    }

    #[test]
    fn select_newer_uses_per_client_watermarks() {
        let store = SecretStore::new();
        store.put("a", secret(1, 10, 100));
        store.put("b", secret(1, 10, 300));
        store.put("c", secret(1, 11, 50));

        let known = BTreeMap::from([(10, 100)]);
        let keys: Vec<String> = store
            .select_newer(&known)
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);

        assert_eq!(store.select_newer(&BTreeMap::new()).len(), 3);
        let up_to_date = store.latest_timestamps();
        assert!(store.select_newer(&up_to_date).is_empty());
    }
}
