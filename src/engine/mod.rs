//! Optimistic mutation engine.
//!
//! [`Engine`] is the context object that ties the [`CacheStore`] to a
//! [`RemoteStore`]. Reads go through the cache (fetch if absent or stale);
//! writes run the optimistic protocol in [`optimistic`]:
//!
//! 1. cancel in-flight reads of every affected key,
//! 2. snapshot those keys,
//! 3. apply the expected post-state and aggregate deltas in one cache batch,
//! 4. issue the remote write,
//! 5. restore the snapshot on failure, then invalidate the keys either way.
//!
//! Queue reordering has its own supersession rules; see [`reorder`].

mod error;
mod mutations;
mod optimistic;
mod reorder;

pub use error::{EngineError, Result};
pub use reorder::{dense_positions, validate_permutation, ReorderOutcome, ReorderPhase};

use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cache::{filtered_list, queue_order, CacheStore, CacheValue, NewsletterFilter, QueryKey};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::{Newsletter, QueueEntry, Source};

/// Default wait before a reorder is submitted
pub const DEFAULT_REORDER_DEBOUNCE: Duration = Duration::from_millis(150);

/// Default maximum number of ids in one bulk mutation
pub const DEFAULT_MAX_BULK_IDS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a reorder waits for a newer gesture before it is submitted.
    pub reorder_debounce: Duration,
    /// Run [`Engine::settle`] at the end of every mutation.
    pub refetch_after_mutation: bool,
    pub max_bulk_ids: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reorder_debounce: DEFAULT_REORDER_DEBOUNCE,
            refetch_after_mutation: true,
            max_bulk_ids: DEFAULT_MAX_BULK_IDS,
        }
    }
}

/// What a mutation did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationReport {
    /// Targeted newsletters that were present in the cache.
    pub matched: usize,
    /// Change applied to the cached unread counter (before clamping).
    pub unread_delta: i64,
    /// Whether the remote store accepted the write.
    pub persisted: bool,
}

pub struct Engine<R> {
    remote: Arc<R>,
    cache: CacheStore,
    config: EngineConfig,
    session: Mutex<Option<i64>>,
    reorder: Mutex<reorder::ReorderState>,
    /// Source of negative ids for optimistically created queue entries
    provisional_ids: AtomicI64,
}

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: RemoteStore> Engine<R> {
    pub fn new(remote: Arc<R>, config: EngineConfig) -> Self {
        Self::with_cache(remote, CacheStore::new(), config)
    }

    /// Build an engine over an existing cache, e.g. one shared with other
    /// consumers that subscribe to its events.
    pub fn with_cache(remote: Arc<R>, cache: CacheStore, config: EngineConfig) -> Self {
        Self {
            remote,
            cache,
            config,
            session: Mutex::new(None),
            reorder: Mutex::new(reorder::ReorderState::default()),
            provisional_ids: AtomicI64::new(-1),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Make `user_id` the active user. Switching users drops the previous
    /// user's cache entries.
    pub fn sign_in(&self, user_id: i64) {
        let previous = lock(&self.session).replace(user_id);
        if let Some(previous) = previous.filter(|&p| p != user_id) {
            self.cache.clear_user(previous);
            lock(&self.reorder).reset();
        }
        tracing::info!(user_id, "Signed in");
    }

    /// Clear the session and that user's cache. Returns the signed-out user.
    pub fn sign_out(&self) -> Option<i64> {
        let user_id = lock(&self.session).take()?;
        self.cache.clear_user(user_id);
        lock(&self.reorder).reset();
        tracing::info!(user_id, "Signed out");
        Some(user_id)
    }

    pub fn current_user(&self) -> Option<i64> {
        *lock(&self.session)
    }

    pub(crate) fn require_user(&self) -> Result<i64> {
        self.current_user().ok_or(EngineError::NotAuthenticated)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn newsletters(&self, filter: NewsletterFilter) -> Result<Arc<Vec<Newsletter>>> {
        let key = QueryKey::newsletters(self.require_user()?, filter);
        let value = self.load(key).await?;
        Ok(value.as_newsletters().cloned().unwrap_or_default())
    }

    pub async fn unread_count(&self) -> Result<i64> {
        let key = QueryKey::unread_count(self.require_user()?);
        let value = self.load(key).await?;
        Ok(value.as_unread_count().unwrap_or_default())
    }

    pub async fn sources(&self) -> Result<Arc<Vec<Source>>> {
        let key = QueryKey::sources(self.require_user()?);
        let value = self.load(key).await?;
        Ok(value.as_sources().cloned().unwrap_or_default())
    }

    pub async fn reading_queue(&self) -> Result<Arc<Vec<QueueEntry>>> {
        let key = QueryKey::reading_queue(self.require_user()?);
        let value = self.load(key).await?;
        Ok(value.as_reading_queue().cloned().unwrap_or_default())
    }

    /// Cached value if fresh, otherwise a fetch.
    async fn load(&self, key: QueryKey) -> Result<CacheValue> {
        if !self.cache.is_stale(&key) {
            if let Some(value) = self.cache.get(&key) {
                return Ok(value);
            }
        }
        self.refetch(key).await
    }

    /// Fetch `key` from the remote store and return the value the cache now
    /// holds. If a write superseded the fetch, the cached value wins.
    pub async fn refetch(&self, key: QueryKey) -> Result<CacheValue> {
        self.fetch_into_cache(key).await.map(|(value, _)| value)
    }

    async fn fetch_into_cache(&self, key: QueryKey) -> Result<(CacheValue, bool)> {
        let ticket = self.cache.begin_fetch(key);
        let fetched = self
            .fetch_value(&key)
            .await
            .map_err(|source| EngineError::RemoteRead { key, source })?;
        let landed = self.cache.complete_fetch(ticket, fetched.clone());
        let value = self.cache.get(&key).unwrap_or(fetched);
        Ok((value, landed))
    }

    async fn fetch_value(&self, key: &QueryKey) -> std::result::Result<CacheValue, RemoteError> {
        Ok(match *key {
            QueryKey::Newsletters { user_id, filter } => {
                let all = self.remote.read_newsletters(user_id).await?;
                CacheValue::Newsletters(Arc::new(filtered_list(&all, &filter)))
            }
            QueryKey::UnreadCount { user_id } => {
                CacheValue::UnreadCount(self.remote.read_unread_count(user_id).await?)
            }
            QueryKey::Sources { user_id } => {
                CacheValue::Sources(Arc::new(self.remote.read_source_counts(user_id).await?))
            }
            QueryKey::ReadingQueue { user_id } => {
                let mut queue = self.remote.read_queue(user_id).await?;
                queue.sort_by(queue_order);
                CacheValue::ReadingQueue(Arc::new(queue))
            }
        })
    }

    /// Refetch every stale key that no write is holding. Returns how many
    /// refetched values landed in the cache.
    ///
    /// All keys are attempted; the first read error is returned afterwards.
    pub async fn settle(&self) -> Result<usize> {
        let keys = self.cache.stale_keys();
        if keys.is_empty() {
            return Ok(0);
        }
        let results = join_all(keys.iter().map(|&key| self.fetch_into_cache(key))).await;

        let mut refreshed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok((_, true)) => refreshed += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Refetch failed while settling");
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::debug!(stale = keys.len(), refreshed, "Settled cache");
        match first_error {
            Some(e) => Err(e),
            None => Ok(refreshed),
        }
    }
}
