use anyhow::Result;
use sqlx::QueryBuilder;
use std::sync::Arc;

use super::schema::Database;
use super::types::Tag;
use crate::util::sanitize_label;

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// Create a tag for `user_id` (or return the existing one with the same
    /// name), returning its id.
    ///
    /// The name is sanitized (control chars stripped, whitespace trimmed)
    /// before insertion.
    pub async fn create_tag(&self, user_id: i64, name: &str) -> Result<i64> {
        let clean_name = sanitize_label(name)?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tags (user_id, name) VALUES (?, ?)
            ON CONFLICT(user_id, name) DO UPDATE SET name = excluded.name
            RETURNING id
        "#,
        )
        .bind(user_id)
        .bind(&clean_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Get all tags of a user ordered by name.
    pub async fn get_tags(&self, user_id: i64) -> Result<Vec<Tag>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM tags WHERE user_id = ? ORDER BY name, id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| Tag {
                id,
                name: Arc::from(name),
            })
            .collect())
    }

    /// Replace the tag set of a newsletter owned by `user_id`.
    ///
    /// Returns `false` (and changes nothing) if the newsletter does not exist
    /// or belongs to another user. Tag ids not owned by `user_id` are skipped.
    pub async fn set_newsletter_tags(
        &self,
        user_id: i64,
        newsletter_id: i64,
        tag_ids: &[i64],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM newsletters WHERE id = ? AND user_id = ?")
                .bind(newsletter_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM newsletter_tags WHERE newsletter_id = ?")
            .bind(newsletter_id)
            .execute(&mut *tx)
            .await?;

        if !tag_ids.is_empty() {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO newsletter_tags (newsletter_id, tag_id) SELECT ");
            builder
                .push_bind(newsletter_id)
                .push(", id FROM tags WHERE user_id = ")
                .push_bind(user_id)
                .push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for tag_id in tag_ids {
                separated.push_bind(*tag_id);
            }
            separated.push_unseparated(")");
            let attached = builder.build().execute(&mut *tx).await?.rows_affected();
            if attached < tag_ids.len() as u64 {
                tracing::debug!(
                    newsletter_id,
                    requested = tag_ids.len(),
                    attached,
                    "Skipped tags not owned by user"
                );
            }
        }

        tx.commit().await?;
        Ok(true)
    }
}
