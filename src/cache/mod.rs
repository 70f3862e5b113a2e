//! In-memory query cache shared by every view of newsletter state.
//!
//! Entries are addressed by [`QueryKey`] and hold immutable [`CacheValue`]s
//! that are replaced, never edited. Each entry also tracks:
//!
//! - a **generation**, bumped by every write, so a fetch that started before
//!   an optimistic write can never land on top of it ([`FetchTicket`]);
//! - a **hold count**, raised while a remote write touching the key is in
//!   flight ([`WriteHold`]), during which fetch results are discarded;
//! - a **stale** flag set by [`CacheStore::invalidate`] and cleared by the
//!   next completed fetch.
//!
//! All operations are synchronous and run under one lock, so an update is
//! atomic with respect to every other cache user.

mod key;
mod value;

pub use key::{Entity, NewsletterFilter, QueryKey};
pub use value::{filtered_list, newsletter_order, queue_order, upsert_in_list, CacheValue};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Capacity of the change-notification channel
const EVENT_CAPACITY: usize = 256;

/// Change notifications for cache consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The value under this key was replaced.
    Updated(QueryKey),
    /// The value is stale and should be refetched by active consumers.
    Invalidated(QueryKey),
    /// Every entry of this user was dropped.
    Cleared { user_id: i64 },
}

#[derive(Debug, Default)]
struct CacheEntry {
    value: Option<CacheValue>,
    stale: bool,
    generation: u64,
    holds: usize,
}

impl CacheEntry {
    fn write(&mut self, value: Option<CacheValue>) {
        self.value = value;
        self.generation += 1;
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<QueryKey, CacheEntry>,
}

/// Proof that a fetch was started; see [`CacheStore::complete_fetch`].
#[derive(Debug)]
#[must_use]
pub struct FetchTicket {
    key: QueryKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

/// Values of a set of keys captured at one instant, restorable verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
    entries: Vec<(QueryKey, Option<CacheValue>)>,
}

impl CacheSnapshot {
    pub fn get(&self, key: &QueryKey) -> Option<&CacheValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_ref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// Keeps fetch results away from a set of keys while a write is in flight.
/// Released on drop.
#[must_use]
pub struct WriteHold {
    cache: CacheStore,
    keys: Vec<QueryKey>,
}

impl Drop for WriteHold {
    fn drop(&mut self) {
        let mut inner = self.cache.lock();
        for key in &self.keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.holds = entry.holds.saturating_sub(1);
            }
        }
    }
}

/// Several reads and writes applied under a single lock.
pub struct CacheBatch<'a> {
    entries: &'a mut HashMap<QueryKey, CacheEntry>,
    touched: Vec<QueryKey>,
}

impl CacheBatch<'_> {
    pub fn get(&self, key: &QueryKey) -> Option<&CacheValue> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    pub fn set(&mut self, key: QueryKey, value: CacheValue) {
        self.entries.entry(key).or_default().write(Some(value));
        self.touched.push(key);
    }

    /// Replace the value under `key` with `f(old)`. Absent keys are left
    /// absent; returns whether an update happened.
    pub fn update(&mut self, key: &QueryKey, f: impl FnOnce(CacheValue) -> CacheValue) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(old) = entry.value.take() else {
            return false;
        };
        entry.write(Some(f(old)));
        self.touched.push(*key);
        true
    }

    /// Keys of `user_id` and `entity` the cache tracks; see [`CacheStore::keys`].
    pub fn keys(&self, user_id: i64, entity: Entity) -> Vec<QueryKey> {
        keys_of(&*self.entries, user_id, entity)
    }
}

fn keys_of(entries: &HashMap<QueryKey, CacheEntry>, user_id: i64, entity: Entity) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = entries
        .keys()
        .filter(|k| k.user_id() == user_id && k.entity() == entity)
        .copied()
        .collect();
    keys.sort_by_cached_key(|k| k.to_string());
    keys
}

/// Shared handle to the cache. Cloning is cheap; clones see the same entries.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Mutex<CacheInner>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.lock().entries.len())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            events,
        }
    }

    /// The lock is never held across an await, so a panic mid-update is the
    /// only way to poison it; the map itself is still consistent then.
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &QueryKey) -> Option<CacheValue> {
        self.lock().entries.get(key).and_then(|e| e.value.clone())
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.lock().entries.get(key).is_some_and(|e| e.stale)
    }

    pub fn is_held(&self, key: &QueryKey) -> bool {
        self.lock().entries.get(key).is_some_and(|e| e.holds > 0)
    }

    /// Keys of `user_id` and `entity` the cache tracks: loaded, or with a
    /// first fetch still pending. Sorted by display form.
    pub fn keys(&self, user_id: i64, entity: Entity) -> Vec<QueryKey> {
        keys_of(&self.lock().entries, user_id, entity)
    }

    /// Loaded, stale keys with no write in flight: what a settle pass refetches.
    pub fn stale_keys(&self) -> Vec<QueryKey> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.stale && e.holds == 0 && e.value.is_some())
            .map(|(k, _)| *k)
            .collect()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn set(&self, key: QueryKey, value: CacheValue) {
        self.batch(|b| b.set(key, value));
    }

    /// Functional replace of a present value; see [`CacheBatch::update`].
    pub fn update(&self, key: &QueryKey, f: impl FnOnce(CacheValue) -> CacheValue) -> bool {
        self.batch(|b| b.update(key, f))
    }

    /// Run `f` against the entries under one lock, then notify consumers of
    /// every key it wrote.
    pub fn batch<T>(&self, f: impl FnOnce(&mut CacheBatch<'_>) -> T) -> T {
        let (result, touched) = {
            let mut inner = self.lock();
            let mut batch = CacheBatch {
                entries: &mut inner.entries,
                touched: Vec::new(),
            };
            let result = f(&mut batch);
            (result, batch.touched)
        };
        for key in touched {
            self.emit(CacheEvent::Updated(key));
        }
        result
    }

    /// Abort any in-flight fetch of `key`: its result will be discarded.
    pub fn cancel_pending(&self, key: &QueryKey) {
        let mut inner = self.lock();
        inner.entries.entry(*key).or_default().generation += 1;
        tracing::debug!(key = %key, "Cancelled pending fetch");
    }

    /// Mark `key` stale so active consumers refetch it.
    pub fn invalidate(&self, key: &QueryKey) {
        let loaded = {
            let mut inner = self.lock();
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.stale = true;
                    entry.value.is_some()
                }
                None => false,
            }
        };
        if loaded {
            tracing::debug!(key = %key, "Invalidated");
            self.emit(CacheEvent::Invalidated(*key));
        }
    }

    /// Invalidate every entry of `user_id`.
    pub fn invalidate_user(&self, user_id: i64) {
        let keys: Vec<QueryKey> = self
            .lock()
            .entries
            .keys()
            .filter(|k| k.user_id() == user_id)
            .copied()
            .collect();
        for key in &keys {
            self.invalidate(key);
        }
    }

    /// Drop every entry of `user_id`; in-flight fetches for them are discarded.
    pub fn clear_user(&self, user_id: i64) {
        self.lock().entries.retain(|k, _| k.user_id() != user_id);
        self.emit(CacheEvent::Cleared { user_id });
    }

    // ========================================================================
    // Fetch Tickets
    // ========================================================================

    pub fn begin_fetch(&self, key: QueryKey) -> FetchTicket {
        let mut inner = self.lock();
        let entry = inner.entries.entry(key).or_default();
        FetchTicket {
            key,
            generation: entry.generation,
        }
    }

    /// Store a fetch result unless the key was written, cancelled, cleared or
    /// held since the ticket was issued. Returns whether the value landed.
    pub fn complete_fetch(&self, ticket: FetchTicket, value: CacheValue) -> bool {
        let landed = {
            let mut inner = self.lock();
            match inner.entries.get_mut(&ticket.key) {
                Some(entry) if entry.generation == ticket.generation && entry.holds == 0 => {
                    entry.write(Some(value));
                    entry.stale = false;
                    true
                }
                _ => false,
            }
        };
        if landed {
            self.emit(CacheEvent::Updated(ticket.key));
        } else {
            tracing::debug!(key = %ticket.key, "Discarded superseded fetch result");
        }
        landed
    }

    // ========================================================================
    // Snapshots and Holds
    // ========================================================================

    pub fn snapshot(&self, keys: &[QueryKey]) -> CacheSnapshot {
        let inner = self.lock();
        CacheSnapshot {
            entries: keys
                .iter()
                .map(|k| (*k, inner.entries.get(k).and_then(|e| e.value.clone())))
                .collect(),
        }
    }

    /// Put every snapshotted value back exactly as captured.
    pub fn restore(&self, snapshot: &CacheSnapshot) {
        let keys: Vec<QueryKey> = {
            let mut inner = self.lock();
            for (key, value) in &snapshot.entries {
                inner.entries.entry(*key).or_default().write(value.clone());
            }
            snapshot.entries.iter().map(|(k, _)| *k).collect()
        };
        for key in keys {
            self.emit(CacheEvent::Updated(key));
        }
    }

    pub fn hold(&self, keys: &[QueryKey]) -> WriteHold {
        let mut inner = self.lock();
        for key in keys {
            inner.entries.entry(*key).or_default().holds += 1;
        }
        WriteHold {
            cache: self.clone(),
            keys: keys.to_vec(),
        }
    }
}
