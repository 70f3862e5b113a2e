use anyhow::Result;
use std::sync::Arc;

use super::schema::Database;
use super::types::{Source, SourceRow};
use crate::util::sanitize_label;

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a source for `user_id` (or return the existing one with the same
    /// name), returning its id.
    pub async fn insert_source(&self, user_id: i64, name: &str) -> Result<i64> {
        let name = sanitize_label(name)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (user_id, name) VALUES (?, ?)
            ON CONFLICT(user_id, name) DO UPDATE SET name = excluded.name
            RETURNING id
        "#,
        )
        .bind(user_id)
        .bind(&name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Get all sources of a user with their count of non-archived newsletters.
    ///
    /// Only newsletters inside the list window are counted.
    pub async fn get_source_counts(&self, user_id: i64) -> Result<Vec<Source>> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            r#"
                SELECT
                    s.id, s.user_id, s.name,
                    COUNT(CASE WHEN n.is_archived = 0 THEN 1 END) AS newsletter_count
                FROM sources s
                LEFT JOIN (
                    SELECT source_id, is_archived FROM newsletters
                    WHERE user_id = ?
                    ORDER BY received_at DESC, id DESC
                    LIMIT ?
                ) n ON s.id = n.source_id
                WHERE s.user_id = ?
                GROUP BY s.id
                ORDER BY s.name, s.id
            "#,
        )
        .bind(user_id)
        .bind(self.list_limit)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, user_id, name, newsletter_count)| Source {
                id,
                user_id,
                name: Arc::from(name),
                newsletter_count,
            })
            .collect())
    }
}
