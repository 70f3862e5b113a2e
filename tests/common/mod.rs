//! Shared fixtures for the engine integration tests.
//!
//! [`GatedRemote`] wraps the SQLite store so tests can hold writes (or reads)
//! in flight, inject write failures and count write calls. Holding a write
//! lets a test poll a mutation once and inspect the optimistic cache state
//! before the store answers.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use letterbox::cache::{NewsletterFilter, QueryKey};
use letterbox::engine::{Engine, EngineConfig};
use letterbox::remote::{RemoteError, RemoteStore};
use letterbox::storage::{
    Database, NewNewsletter, Newsletter, NewsletterFields, QueueEntry, QueuePosition, Source,
};

pub const USER: i64 = 1;
pub const OTHER_USER: i64 = 2;

pub struct GatedRemote {
    pub db: Database,
    write_gate: watch::Sender<bool>,
    read_gate: watch::Sender<bool>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

async fn pass(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    let _ = rx.wait_for(|open| *open).await;
}

impl GatedRemote {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_gate: watch::channel(true).0,
            read_gate: watch::channel(true).0,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Writes block after being counted until [`GatedRemote::open_writes`].
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn open_writes(&self) {
        self.write_gate.send_replace(true);
    }

    /// Reads complete against the store, then block before returning.
    pub fn hold_reads(&self) {
        self.read_gate.send_replace(false);
    }

    pub fn open_reads(&self) {
        self.read_gate.send_replace(true);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn before_write(&self) -> Result<(), RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        pass(&self.write_gate).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Store(anyhow::anyhow!("connection reset by peer")));
        }
        Ok(())
    }

    async fn after_read<T>(&self, value: T) -> Result<T, RemoteError> {
        pass(&self.read_gate).await;
        Ok(value)
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn read_newsletters(&self, user_id: i64) -> Result<Vec<Newsletter>, RemoteError> {
        let value = RemoteStore::read_newsletters(&self.db, user_id).await?;
        self.after_read(value).await
    }

    async fn read_unread_count(&self, user_id: i64) -> Result<i64, RemoteError> {
        let value = RemoteStore::read_unread_count(&self.db, user_id).await?;
        self.after_read(value).await
    }

    async fn read_source_counts(&self, user_id: i64) -> Result<Vec<Source>, RemoteError> {
        let value = RemoteStore::read_source_counts(&self.db, user_id).await?;
        self.after_read(value).await
    }

    async fn read_queue(&self, user_id: i64) -> Result<Vec<QueueEntry>, RemoteError> {
        let value = RemoteStore::read_queue(&self.db, user_id).await?;
        self.after_read(value).await
    }

    async fn write_newsletter_fields(
        &self,
        user_id: i64,
        id: i64,
        fields: NewsletterFields,
    ) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::write_newsletter_fields(&self.db, user_id, id, fields).await
    }

    async fn write_newsletter_fields_bulk(
        &self,
        user_id: i64,
        ids: &[i64],
        fields: NewsletterFields,
    ) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::write_newsletter_fields_bulk(&self.db, user_id, ids, fields).await
    }

    async fn delete_newsletter(&self, user_id: i64, id: i64) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::delete_newsletter(&self.db, user_id, id).await
    }

    async fn delete_newsletters(&self, user_id: i64, ids: &[i64]) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::delete_newsletters(&self.db, user_id, ids).await
    }

    async fn set_newsletter_tags(
        &self,
        user_id: i64,
        id: i64,
        tag_ids: &[i64],
    ) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::set_newsletter_tags(&self.db, user_id, id, tag_ids).await
    }

    async fn insert_queue_entry(
        &self,
        user_id: i64,
        newsletter_id: i64,
        position: i64,
    ) -> Result<QueueEntry, RemoteError> {
        self.before_write().await?;
        RemoteStore::insert_queue_entry(&self.db, user_id, newsletter_id, position).await
    }

    async fn delete_queue_entry(&self, user_id: i64, entry_id: i64) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::delete_queue_entry(&self.db, user_id, entry_id).await
    }

    async fn reorder_queue(
        &self,
        user_id: i64,
        positions: &[QueuePosition],
    ) -> Result<(), RemoteError> {
        self.before_write().await?;
        RemoteStore::reorder_queue(&self.db, user_id, positions).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn test_config() -> EngineConfig {
    EngineConfig {
        reorder_debounce: Duration::from_millis(20),
        refetch_after_mutation: true,
        max_bulk_ids: 10,
    }
}

pub struct Fixture {
    pub engine: Engine<GatedRemote>,
    pub remote: Arc<GatedRemote>,
}

impl Fixture {
    pub async fn new(config: EngineConfig) -> Self {
        let db = Database::open(":memory:").await.unwrap();
        let remote = Arc::new(GatedRemote::new(db));
        let engine = Engine::new(Arc::clone(&remote), config);
        engine.sign_in(USER);
        Self { engine, remote }
    }

    pub fn db(&self) -> &Database {
        &self.remote.db
    }

    pub async fn source(&self, name: &str) -> i64 {
        self.db().insert_source(USER, name).await.unwrap()
    }

    pub async fn newsletter(&self, title: &str, source_id: Option<i64>, received_at: i64) -> i64 {
        self.db()
            .insert_newsletter(
                USER,
                &NewNewsletter {
                    title: title.to_string(),
                    source_id,
                    received_at,
                },
            )
            .await
            .unwrap()
    }

    pub async fn set_fields(&self, id: i64, fields: NewsletterFields) {
        self.db()
            .update_newsletter_fields(USER, &[id], &fields)
            .await
            .unwrap();
    }

    /// Queue a newsletter directly in the store, returning the entry id.
    pub async fn enqueue(&self, newsletter_id: i64, position: i64) -> i64 {
        self.db()
            .insert_queue_entry(USER, newsletter_id, position)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    /// Load every view into the cache.
    pub async fn prime(&self) {
        self.engine.newsletters(NewsletterFilter::inbox()).await.unwrap();
        self.engine.newsletters(NewsletterFilter::all()).await.unwrap();
        self.engine.unread_count().await.unwrap();
        self.engine.sources().await.unwrap();
        self.engine.reading_queue().await.unwrap();
    }

    // Synchronous cache reads, safe while a mutation is suspended.

    pub fn cached_unread(&self) -> Option<i64> {
        self.engine
            .cache()
            .get(&QueryKey::unread_count(USER))?
            .as_unread_count()
    }

    pub fn cached_source_count(&self, source_id: i64) -> Option<i64> {
        let value = self.engine.cache().get(&QueryKey::sources(USER))?;
        value
            .as_sources()?
            .iter()
            .find(|s| s.id == source_id)
            .map(|s| s.newsletter_count)
    }

    pub fn cached_list(&self, filter: NewsletterFilter) -> Vec<Newsletter> {
        self.engine
            .cache()
            .get(&QueryKey::newsletters(USER, filter))
            .and_then(|v| v.as_newsletters().map(|l| l.to_vec()))
            .unwrap_or_default()
    }

    pub fn cached_newsletter(&self, id: i64) -> Option<Newsletter> {
        self.cached_list(NewsletterFilter::all())
            .into_iter()
            .find(|n| n.id == id)
    }

    pub fn cached_queue(&self) -> Vec<QueueEntry> {
        self.engine
            .cache()
            .get(&QueryKey::reading_queue(USER))
            .and_then(|v| v.as_reading_queue().map(|q| q.to_vec()))
            .unwrap_or_default()
    }

    /// Assert the settled aggregates match a recount over the full list.
    pub async fn assert_settled_invariants(&self) {
        self.engine.settle().await.unwrap();
        let all = self.engine.newsletters(NewsletterFilter::all()).await.unwrap();

        let unread = all.iter().filter(|n| !n.is_read && !n.is_archived).count() as i64;
        assert_eq!(self.engine.unread_count().await.unwrap(), unread, "unread counter");

        for source in self.engine.sources().await.unwrap().iter() {
            let expected = all
                .iter()
                .filter(|n| n.source_id == Some(source.id) && !n.is_archived)
                .count() as i64;
            assert_eq!(source.newsletter_count, expected, "count of source {}", source.id);
        }

        let queue = self.engine.reading_queue().await.unwrap();
        for pair in queue.windows(2) {
            assert!(
                (pair[0].position, pair[0].id) < (pair[1].position, pair[1].id),
                "queue order"
            );
        }
        for entry in queue.iter() {
            assert!(
                all.iter().any(|n| n.id == entry.newsletter_id),
                "queue entry {} refers to a missing newsletter",
                entry.id
            );
        }
    }
}
