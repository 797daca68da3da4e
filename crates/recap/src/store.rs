//! Per-conversation cache entries and the store that owns them.
//!
//! The store exposes whole-entry reads and writes only. Read-modify-write
//! sequences are serialized by the [`ContextCache`](crate::coordinator::ContextCache),
//! which holds a per-conversation lock around them; the store's own mutex only
//! protects the map itself and is never held across an await.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::StoreConfig;

/// Cached rolling context for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub conversation_id: i64,
    /// Messages consumed since the last refresh. Always in `step..=threshold`.
    pub refresh_counter: usize,
    /// The current rolling summary, replaced only by a successful refresh.
    pub summary_text: String,
}

/// Whole-entry storage keyed by conversation id.
///
/// `get` returns `None` for a conversation that has never been summarized
/// (or whose entry was evicted); it never fabricates a default entry.
pub trait CacheStore: Send + Sync {
    fn get(&self, conversation_id: i64) -> Option<CacheEntry>;

    /// Read without counting as an access: no recency bump, no lazy expiry.
    /// Stores that track no access state can rely on the default.
    fn peek(&self, conversation_id: i64) -> Option<CacheEntry> {
        self.get(conversation_id)
    }

    /// Insert or replace the entry for `entry.conversation_id`.
    fn put(&self, entry: CacheEntry);

    fn remove(&self, conversation_id: i64) -> Option<CacheEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len(),
            ..StoreStats::default()
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    touched: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<i64, Slot>,
    evictions: u64,
    expirations: u64,
}

/// Eviction counters for an [`InMemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub evictions: u64,
    pub expirations: u64,
}

/// Process-local bounded store.
///
/// Holds at most `max_entries` conversations, evicting the least recently
/// touched one on overflow. Entries untouched for longer than `ttl` read as
/// absent and are dropped lazily or by [`CacheStore::purge_expired`].
#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Option<Duration>,
}

impl InMemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: config.max_entries.max(1),
            ttl: config.ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, slot: &Slot) -> bool {
        self.ttl.is_some_and(|ttl| slot.touched.elapsed() > ttl)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl CacheStore for InMemoryStore {
    fn get(&self, conversation_id: i64) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let expired = inner
            .slots
            .get(&conversation_id)
            .is_some_and(|slot| self.is_expired(slot));
        if expired {
            inner.slots.remove(&conversation_id);
            inner.expirations += 1;
            debug!(conversation_id, "context entry expired");
            return None;
        }
        let slot = inner.slots.get_mut(&conversation_id)?;
        slot.touched = Instant::now();
        Some(slot.entry.clone())
    }

    fn peek(&self, conversation_id: i64) -> Option<CacheEntry> {
        let inner = self.lock();
        let slot = inner.slots.get(&conversation_id)?;
        if self.is_expired(slot) {
            return None;
        }
        Some(slot.entry.clone())
    }

    fn put(&self, entry: CacheEntry) {
        let mut inner = self.lock();
        let id = entry.conversation_id;
        if !inner.slots.contains_key(&id) && inner.slots.len() >= self.max_entries {
            let oldest = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.touched)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                inner.slots.remove(&oldest);
                inner.evictions += 1;
                debug!(conversation_id = oldest, "evicted least recently used context");
            }
        }
        inner.slots.insert(
            id,
            Slot {
                entry,
                touched: Instant::now(),
            },
        );
    }

    fn remove(&self, conversation_id: i64) -> Option<CacheEntry> {
        self.lock()
            .slots
            .remove(&conversation_id)
            .map(|slot| slot.entry)
    }

    fn len(&self) -> usize {
        self.lock().slots.len()
    }

    fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| slot.touched.elapsed() <= ttl);
        let removed = before - inner.slots.len();
        inner.expirations += removed as u64;
        if removed > 0 {
            debug!(removed, "purged expired context entries");
        }
        removed
    }

    fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            entries: inner.slots.len(),
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }
}
