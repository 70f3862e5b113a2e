//! The remote store contract the cache engine writes through.
//!
//! The engine never talks to storage directly; everything goes through
//! [`RemoteStore`], so tests can wrap the real store with failure injection
//! or latency gates.

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::{Database, Newsletter, NewsletterFields, QueueEntry, QueuePosition, Source};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The targeted row no longer exists in the store.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Transport, constraint or other store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Minimum surface the engine needs from the persistence layer.
///
/// Writes are point updates except [`RemoteStore::reorder_queue`], which
/// must apply every position or none. Every write is scoped to `user_id`:
/// rows owned by another user are treated as missing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn read_newsletters(&self, user_id: i64) -> Result<Vec<Newsletter>, RemoteError>;

    async fn read_unread_count(&self, user_id: i64) -> Result<i64, RemoteError>;

    async fn read_source_counts(&self, user_id: i64) -> Result<Vec<Source>, RemoteError>;

    /// Entries ordered by position.
    async fn read_queue(&self, user_id: i64) -> Result<Vec<QueueEntry>, RemoteError>;

    async fn write_newsletter_fields(
        &self,
        user_id: i64,
        id: i64,
        fields: NewsletterFields,
    ) -> Result<(), RemoteError>;

    /// Single batched write for bulk actions.
    async fn write_newsletter_fields_bulk(
        &self,
        user_id: i64,
        ids: &[i64],
        fields: NewsletterFields,
    ) -> Result<(), RemoteError>;

    async fn delete_newsletter(&self, user_id: i64, id: i64) -> Result<(), RemoteError>;

    async fn delete_newsletters(&self, user_id: i64, ids: &[i64]) -> Result<(), RemoteError>;

    /// Tag ids the user does not own are skipped.
    async fn set_newsletter_tags(
        &self,
        user_id: i64,
        id: i64,
        tag_ids: &[i64],
    ) -> Result<(), RemoteError>;

    async fn insert_queue_entry(
        &self,
        user_id: i64,
        newsletter_id: i64,
        position: i64,
    ) -> Result<QueueEntry, RemoteError>;

    async fn delete_queue_entry(&self, user_id: i64, entry_id: i64) -> Result<(), RemoteError>;

    /// Atomic: all rows are updated together or none are.
    async fn reorder_queue(
        &self,
        user_id: i64,
        positions: &[QueuePosition],
    ) -> Result<(), RemoteError>;
}

fn newsletter_not_found(id: i64) -> RemoteError {
    RemoteError::NotFound {
        entity: "newsletter",
        id,
    }
}

#[async_trait]
impl RemoteStore for Database {
    async fn read_newsletters(&self, user_id: i64) -> Result<Vec<Newsletter>, RemoteError> {
        Ok(self.get_newsletters(user_id).await?)
    }

    async fn read_unread_count(&self, user_id: i64) -> Result<i64, RemoteError> {
        Ok(self.get_unread_count(user_id).await?)
    }

    async fn read_source_counts(&self, user_id: i64) -> Result<Vec<Source>, RemoteError> {
        Ok(self.get_source_counts(user_id).await?)
    }

    async fn read_queue(&self, user_id: i64) -> Result<Vec<QueueEntry>, RemoteError> {
        Ok(self.get_reading_queue(user_id).await?)
    }

    async fn write_newsletter_fields(
        &self,
        user_id: i64,
        id: i64,
        fields: NewsletterFields,
    ) -> Result<(), RemoteError> {
        let affected = self.update_newsletter_fields(user_id, &[id], &fields).await?;
        if affected == 0 {
            return Err(newsletter_not_found(id));
        }
        Ok(())
    }

    async fn write_newsletter_fields_bulk(
        &self,
        user_id: i64,
        ids: &[i64],
        fields: NewsletterFields,
    ) -> Result<(), RemoteError> {
        let affected = self.update_newsletter_fields(user_id, ids, &fields).await?;
        match ids.first() {
            Some(&id) if affected == 0 => return Err(newsletter_not_found(id)),
            _ if affected < ids.len() as u64 => tracing::debug!(
                requested = ids.len(),
                affected,
                "Bulk field write skipped missing newsletters"
            ),
            _ => {}
        }
        Ok(())
    }

    async fn delete_newsletter(&self, user_id: i64, id: i64) -> Result<(), RemoteError> {
        if Database::delete_newsletters(self, user_id, &[id]).await? == 0 {
            return Err(newsletter_not_found(id));
        }
        Ok(())
    }

    async fn delete_newsletters(&self, user_id: i64, ids: &[i64]) -> Result<(), RemoteError> {
        let removed = Database::delete_newsletters(self, user_id, ids).await?;
        match ids.first() {
            Some(&id) if removed == 0 => Err(newsletter_not_found(id)),
            _ => Ok(()),
        }
    }

    async fn set_newsletter_tags(
        &self,
        user_id: i64,
        id: i64,
        tag_ids: &[i64],
    ) -> Result<(), RemoteError> {
        if !Database::set_newsletter_tags(self, user_id, id, tag_ids).await? {
            return Err(newsletter_not_found(id));
        }
        Ok(())
    }

    async fn insert_queue_entry(
        &self,
        user_id: i64,
        newsletter_id: i64,
        position: i64,
    ) -> Result<QueueEntry, RemoteError> {
        Database::insert_queue_entry(self, user_id, newsletter_id, position)
            .await?
            .ok_or_else(|| newsletter_not_found(newsletter_id))
    }

    async fn delete_queue_entry(&self, user_id: i64, entry_id: i64) -> Result<(), RemoteError> {
        if !Database::delete_queue_entry(self, user_id, entry_id).await? {
            return Err(RemoteError::NotFound {
                entity: "queue entry",
                id: entry_id,
            });
        }
        Ok(())
    }

    async fn reorder_queue(
        &self,
        user_id: i64,
        positions: &[QueuePosition],
    ) -> Result<(), RemoteError> {
        Ok(Database::reorder_queue(self, user_id, positions).await?)
    }
}
