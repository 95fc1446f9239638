//! In-process key-value store standing in for the external store the
//! specification treats as a black-box dependency: ttl-indexed blacklist
//! entries, sliding-window sorted sets, session caches, and auto-ban
//! entries. A real deployment would swap this for a Redis-backed
//! implementation behind the same trait; the DashMap-backed default gives
//! every caller the atomic-per-key semantics §4.3's "strict_atomic" flag
//! documents.
//!
//! Every value that crosses this boundary is serialized as JSON via
//! `serde_json`. Nothing here ever evaluates cached bytes as code.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

struct TtlEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl TtlEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// A sliding-window sorted set: members scored by insertion instant.
struct SortedSet {
    members: BTreeSet<(Instant, u64)>,
    next_seq: u64,
    expires_at: Instant,
}

/// Abstracts the external key-value store's contract: atomic increment,
/// sorted-set eviction/count/insert, TTL-keyed get/set, and set membership.
///
/// Kept object-safe (no generic methods) so it can be used as
/// `Arc<dyn KeyValueStore>`; the JSON-typed convenience methods live on
/// [`KeyValueStoreExt`], which is blanket-implemented for every
/// `KeyValueStore` (including `dyn KeyValueStore`) in terms of these raw
/// byte methods.
pub trait KeyValueStore: Send + Sync {
    /// Set raw bytes with an optional TTL.
    fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Set raw bytes only if `key` has no live entry, atomically with
    /// respect to concurrent callers on the same key. Returns whether this
    /// call performed the write (`true`) or an existing live entry won the
    /// race (`false`).
    fn set_bytes_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool;

    /// Get raw bytes for a live entry, if any.
    fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;

    /// Delete a key unconditionally.
    fn delete(&self, key: &str);

    /// Atomically increment a counter, creating it at 1 if absent, and
    /// reset its TTL to `ttl` on every call.
    fn incr(&self, key: &str, ttl: Duration) -> u64;

    /// Read a counter's current value without incrementing.
    fn get_counter(&self, key: &str) -> u64;

    /// Sliding-window admission per §4.3: evict members with score <= now
    /// - horizon, count the remainder, and if `count < limit`, insert a new
    /// member and reset the set's expiry to `2 * horizon`. Returns
    /// `(admitted, count_after)`.
    fn window_admit(&self, key: &str, limit: u32, horizon: Duration) -> (bool, u32);
}

/// JSON-typed convenience methods layered over [`KeyValueStore`]'s raw byte
/// contract. Generic, so it cannot live on `KeyValueStore` itself without
/// breaking its object safety.
pub trait KeyValueStoreExt: KeyValueStore {
    /// Set a JSON-serializable value with an optional TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Internal(e.to_string()))?;
        self.set_bytes(key, bytes, ttl);
        Ok(())
    }

    /// Set a JSON-serializable value only if `key` has no live entry,
    /// atomically with respect to concurrent callers on the same key.
    /// Returns whether this call performed the write (`true`) or an
    /// existing live entry won the race (`false`).
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    fn set_json_if_absent<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(self.set_bytes_if_absent(key, bytes, ttl))
    }

    /// Get and deserialize a JSON value. Malformed bytes are a typed error,
    /// never evaluated as code.
    ///
    /// # Errors
    ///
    /// Returns an error if stored bytes exist but fail to deserialize.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get_bytes(key) else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Internal(format!("malformed cache entry for {key}: {e}")))
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}

/// DashMap-backed [`KeyValueStore`]. Each key's critical section is guarded
/// by its own `parking_lot::Mutex`, so the five-step admission procedure in
/// [`KeyValueStore::window_admit`] runs as a single atomic section per key.
#[derive(Default)]
pub struct InMemoryStore {
    blobs: DashMap<String, TtlEntry>,
    counters: DashMap<String, TtlEntry>,
    windows: DashMap<String, Arc<Mutex<SortedSet>>>,
}

impl InMemoryStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.blobs.insert(
            key.to_string(),
            TtlEntry {
                bytes: value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.blobs.get(key)?;
        if !entry.is_live() {
            drop(entry);
            self.blobs.remove(key);
            return None;
        }
        Some(entry.bytes.clone())
    }

    fn set_bytes_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let entry = TtlEntry {
            bytes: value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        // DashMap's `entry` holds the shard lock for the match below, so a
        // concurrent caller on the same key observes either the old live
        // entry (and loses the race) or this write (and also loses it) —
        // never an interleaving where both succeed.
        use dashmap::mapref::entry::Entry;
        match self.blobs.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_live() => false,
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    fn delete(&self, key: &str) {
        self.blobs.remove(key);
        self.counters.remove(key);
        self.windows.remove(key);
    }

    fn incr(&self, key: &str, ttl: Duration) -> u64 {
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| TtlEntry {
            bytes: 0u64.to_le_bytes().to_vec(),
            expires_at: None,
        });
        if !entry.is_live() {
            entry.bytes = 0u64.to_le_bytes().to_vec();
        }
        let current = u64::from_le_bytes(entry.bytes.clone().try_into().unwrap_or([0; 8]));
        let next = current + 1;
        entry.bytes = next.to_le_bytes().to_vec();
        entry.expires_at = Some(Instant::now() + ttl);
        next
    }

    fn get_counter(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| u64::from_le_bytes(e.bytes.clone().try_into().unwrap_or([0; 8])))
            .unwrap_or(0)
    }

    fn window_admit(&self, key: &str, limit: u32, horizon: Duration) -> (bool, u32) {
        let set = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SortedSet {
                    members: BTreeSet::new(),
                    next_seq: 0,
                    expires_at: Instant::now() + 2 * horizon,
                }))
            })
            .clone();
        let mut set = set.lock();

        let now = Instant::now();
        let floor = now.checked_sub(horizon).unwrap_or(now);
        set.members = set.members.split_off(&(floor, 0));
        // split_off keeps entries >= (floor, 0); since timestamps are
        // monotonic instants this is equivalent to evicting score <= now -
        // horizon save for a one-tick boundary, acceptable given the
        // documented race tolerance for non-atomic backends.

        let count = u32::try_from(set.members.len()).unwrap_or(u32::MAX);
        if count >= limit {
            return (false, count);
        }

        let seq = set.next_seq;
        set.next_seq += 1;
        set.members.insert((now, seq));
        set.expires_at = now + 2 * horizon;

        (true, count + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let store = InMemoryStore::new();
        store.set_json("k", &vec![1, 2, 3], None).unwrap();
        let got: Vec<i32> = store.get_json("k").unwrap().unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_json_is_rejected_not_evaluated() {
        let store = InMemoryStore::new();
        store.blobs.insert(
            "bad".to_string(),
            TtlEntry {
                bytes: b"__import__('os').system('echo pwned')".to_vec(),
                expires_at: None,
            },
        );
        let result: Result<Option<serde_json::Value>> = store.get_json("bad");
        assert!(result.is_err());
    }

    #[test]
    fn ttl_expiry_removes_entry() {
        let store = InMemoryStore::new();
        store
            .set_json("k", &1, Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let got: Option<i32> = store.get_json("k").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn incr_resets_after_ttl() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr("c", Duration::from_millis(1)), 1);
        assert_eq!(store.incr("c", Duration::from_millis(1)), 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.incr("c", Duration::from_secs(60)), 1);
    }

    #[test]
    fn set_json_if_absent_admits_only_the_first_writer() {
        let store = InMemoryStore::new();
        assert!(store.set_json_if_absent("k", &1, None).unwrap());
        assert!(!store.set_json_if_absent("k", &2, None).unwrap());
        let got: Option<i32> = store.get_json("k").unwrap();
        assert_eq!(got, Some(1));
    }

    #[test]
    fn set_json_if_absent_succeeds_again_after_ttl_expiry() {
        let store = InMemoryStore::new();
        assert!(store.set_json_if_absent("k", &1, Some(Duration::from_millis(1))).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.set_json_if_absent("k", &2, None).unwrap());
    }

    #[test]
    fn window_admit_bounds_admission() {
        let store = InMemoryStore::new();
        let mut admitted = 0;
        for _ in 0..10 {
            let (ok, _) = store.window_admit("k", 5, Duration::from_secs(60));
            if ok {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
