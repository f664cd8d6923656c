//! In-process key-value store with lazy expiry.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{BoxFuture, KvError, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local [`KvStore`] backed by a mutex-guarded map.
///
/// Expired entries are dropped lazily when touched by any operation, so the
/// map never needs a reaper of its own. This store provides the same
/// conditional semantics as the networked backend but only within one
/// process; it is the fallback for environments without a shared store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Returns `true` if the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry for `key` if it has expired, then returns whether a
    /// live entry remains.
    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> bool {
        match entries.get(key) {
            Some(entry) if entry.expires_at <= now => {
                entries.remove(key);
                false
            },
            Some(_) => true,
            None => false,
        }
    }
}

impl KvStore for MemoryKvStore {
    fn set_nx_px<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            if Self::purge_expired(&mut entries, key, now) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            if !Self::purge_expired(&mut entries, key, now) {
                return Ok(None);
            }
            Ok(entries.get(key).map(|e| e.value.clone()))
        })
    }

    fn del_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            if !Self::purge_expired(&mut entries, key, now) {
                return Ok(false);
            }
            let matches = entries.get(key).is_some_and(|e| e.value == expected);
            if matches {
                entries.remove(key);
            }
            Ok(matches)
        })
    }

    fn pexpire_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().unwrap();
            if !Self::purge_expired(&mut entries, key, now) {
                return Ok(false);
            }
            match entries.get_mut(key) {
                Some(entry) if entry.value == expected => {
                    entry.expires_at = now + ttl;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }
}
