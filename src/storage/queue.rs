use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{QueueEntry, QueuePosition};

impl Database {
    // ========================================================================
    // Reading Queue Operations
    // ========================================================================

    /// Get the reading queue of a user ordered by position (ties by id).
    pub async fn get_reading_queue(&self, user_id: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueEntry>(
            r#"
            SELECT id, user_id, newsletter_id, position
            FROM reading_queue
            WHERE user_id = ?
            ORDER BY position, id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Queue a newsletter of `user_id` at `position`, returning the created
    /// entry.
    ///
    /// Returns `None` if the newsletter does not exist or belongs to another
    /// user. Fails if the user already queued it (UNIQUE constraint).
    pub async fn insert_queue_entry(
        &self,
        user_id: i64,
        newsletter_id: i64,
        position: i64,
    ) -> Result<Option<QueueEntry>> {
        let now = chrono::Utc::now().timestamp();
        let entry = sqlx::query_as::<_, QueueEntry>(
            r#"
            INSERT INTO reading_queue (user_id, newsletter_id, position, created_at)
            SELECT user_id, id, ?, ? FROM newsletters WHERE id = ? AND user_id = ?
            RETURNING id, user_id, newsletter_id, position
        "#,
        )
        .bind(position)
        .bind(now)
        .bind(newsletter_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Remove a queue entry of `user_id`, returns whether a row was deleted.
    pub async fn delete_queue_entry(&self, user_id: i64, entry_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM reading_queue WHERE id = ? AND user_id = ?")
            .bind(entry_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite queue positions of `user_id` in one transaction.
    ///
    /// All rows are updated or none: if any id is missing or belongs to
    /// another user the transaction is rolled back and an error returned.
    pub async fn reorder_queue(&self, user_id: i64, positions: &[QueuePosition]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for item in positions {
            let result = sqlx::query(
                "UPDATE reading_queue SET position = ? WHERE id = ? AND user_id = ?",
            )
            .bind(item.position)
            .bind(item.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back the rows already written.
                bail!("Queue entry {} not found", item.id);
            }
        }
        tx.commit().await?;

        tracing::debug!(user_id, entries = positions.len(), "Reading queue reordered");
        Ok(())
    }
}
