//! # Local Tier
//!
//! Process-local cache store. Fastest tier, owned exclusively by this
//! process, lost on restart. It is a best-effort accelerator in front of the
//! shared store, never a correctness boundary, so no cross-process
//! synchronization is attempted.
//!
//! Memory is bounded by entry count instead of a background sweeper: expired
//! entries are dropped lazily when read, and an insertion at capacity evicts
//! the fifth of the map closest to expiry before the new entry goes in.

use std::collections::HashMap;
use std::sync::Mutex;

struct Record {
    bytes: Vec<u8>,
    expires_at_ms: u64,
}

pub struct LocalStore {
    max_entries: usize,
    map: Mutex<HashMap<String, Record>>,
}

impl LocalStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stored bytes if present and not expired at `now_ms`.
    /// An expired entry is removed on the spot.
    pub fn get(&self, key: &str, now_ms: u64) -> Option<Vec<u8>> {
        let mut map = self.map.lock().unwrap();

        match map.get(key) {
            Some(record) if now_ms > record.expires_at_ms => {
                map.remove(key);
                None
            }
            Some(record) => Some(record.bytes.clone()),
            None => None,
        }
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>, expires_at_ms: u64) {
        let mut map = self.map.lock().unwrap();

        if !map.contains_key(key) && map.len() >= self.max_entries {
            Self::evict_closest_to_expiry(&mut map, self.max_entries);
        }

        map.insert(key.to_string(), Record { bytes, expires_at_ms });
    }

    pub fn remove(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    // Drops the 20% of entries with the nearest expiry timestamps.
    fn evict_closest_to_expiry(map: &mut HashMap<String, Record>, max_entries: usize) {
        let count = (max_entries / 5).max(1);

        let mut by_expiry: Vec<(String, u64)> = map
            .iter()
            .map(|(key, record)| (key.clone(), record.expires_at_ms))
            .collect();
        by_expiry.sort_by_key(|(_, expires_at_ms)| *expires_at_ms);

        for (key, _) in by_expiry.into_iter().take(count) {
            map.remove(&key);
        }
    }
}
