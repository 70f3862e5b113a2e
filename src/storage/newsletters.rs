use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::sync::Arc;

use super::schema::Database;
use super::types::{NewNewsletter, Newsletter, NewsletterDbRow, NewsletterFields, Tag};

/// Default size of the newsletter window: the newest rows a list query
/// returns and the aggregates count over (OOM protection).
pub(crate) const MAX_NEWSLETTERS: i64 = 5000;

/// Ids per statement; keeps us well under SQLite's bind-parameter limit.
const CHUNK_SIZE: usize = 500;

impl Database {
    // ========================================================================
    // Newsletter Inserts
    // ========================================================================

    /// Insert a newsletter for `user_id`, returning its id.
    pub async fn insert_newsletter(&self, user_id: i64, newsletter: &NewNewsletter) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO newsletters (user_id, source_id, title, received_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(user_id)
        .bind(newsletter.source_id)
        .bind(&newsletter.title)
        .bind(newsletter.received_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    // ========================================================================
    // Newsletter Queries
    // ========================================================================

    /// Get the newest `list_limit` newsletters of a user, newest first, with
    /// tags attached.
    ///
    /// Filtering into views happens client-side in the cache layer.
    pub async fn get_newsletters(&self, user_id: i64) -> Result<Vec<Newsletter>> {
        let rows = sqlx::query_as::<_, NewsletterDbRow>(
            r#"
            SELECT id, user_id, source_id, title, is_read, is_liked, is_archived,
                   received_at, updated_at
            FROM newsletters
            WHERE user_id = ?
            ORDER BY received_at DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(user_id)
        .bind(self.list_limit)
        .fetch_all(&self.pool)
        .await?;

        let tag_rows: Vec<(i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT nt.newsletter_id, t.id, t.name
            FROM newsletter_tags nt
            JOIN tags t ON t.id = nt.tag_id
            JOIN newsletters n ON n.id = nt.newsletter_id
            WHERE n.user_id = ?
            ORDER BY t.name, t.id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tags_by_newsletter: HashMap<i64, Vec<Tag>> = HashMap::new();
        for (newsletter_id, id, name) in tag_rows {
            tags_by_newsletter
                .entry(newsletter_id)
                .or_default()
                .push(Tag {
                    id,
                    name: Arc::from(name),
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let tags = tags_by_newsletter.remove(&row.id).unwrap_or_default();
                row.into_newsletter(tags)
            })
            .collect())
    }

    /// Count newsletters that are neither read nor archived.
    ///
    /// Counts over the same window [`Database::get_newsletters`] returns, so
    /// the count agrees with the list.
    pub async fn get_unread_count(&self, user_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT is_read, is_archived FROM newsletters
                WHERE user_id = ?
                ORDER BY received_at DESC, id DESC
                LIMIT ?
            )
            WHERE is_read = 0 AND is_archived = 0
        "#,
        )
        .bind(user_id)
        .bind(self.list_limit)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Newsletter Mutations
    // ========================================================================

    /// Apply a partial field update to every id in `ids` owned by `user_id`,
    /// returning the number of rows matched.
    ///
    /// Rows already in the target state still count: the update is idempotent
    /// and `updated_at` is refreshed either way. Ids of other users match
    /// nothing.
    pub async fn update_newsletter_fields(
        &self,
        user_id: i64,
        ids: &[i64],
        fields: &NewsletterFields,
    ) -> Result<u64> {
        if ids.is_empty() || fields.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in ids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE newsletters SET is_read = COALESCE(");
            builder.push_bind(fields.is_read);
            builder.push(", is_read), is_liked = COALESCE(");
            builder.push_bind(fields.is_liked);
            builder.push(", is_liked), is_archived = COALESCE(");
            builder.push_bind(fields.is_archived);
            builder.push(", is_archived), updated_at = ");
            builder.push_bind(now);
            builder.push(" WHERE user_id = ");
            builder.push_bind(user_id);
            builder.push(" AND id IN (");

            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    /// Permanently delete newsletters owned by `user_id`, returning the number
    /// of rows removed.
    ///
    /// Queue entries and tag links cascade via foreign keys.
    pub async fn delete_newsletters(&self, user_id: i64, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in ids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM newsletters WHERE user_id = ");
            builder.push_bind(user_id);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewNewsletter, NewsletterFields};

    const USER: i64 = 1;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_newsletter(title: &str, source_id: Option<i64>, received_at: i64) -> NewNewsletter {
        NewNewsletter {
            title: title.to_string(),
            source_id,
            received_at,
        }
    }

    #[tokio::test]
    async fn test_insert_and_list_newest_first() {
        let db = test_db().await;
        let older = db
            .insert_newsletter(USER, &test_newsletter("Older", None, 100))
            .await
            .unwrap();
        let newer = db
            .insert_newsletter(USER, &test_newsletter("Newer", None, 200))
            .await
            .unwrap();

        let list = db.get_newsletters(USER).await.unwrap();
        let ids: Vec<i64> = list.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![newer, older]);
        assert!(list.iter().all(|n| !n.is_read && !n.is_archived));
    }

    #[tokio::test]
    async fn test_list_scoped_to_user() {
        let db = test_db().await;
        db.insert_newsletter(USER, &test_newsletter("Mine", None, 1))
            .await
            .unwrap();
        db.insert_newsletter(2, &test_newsletter("Theirs", None, 1))
            .await
            .unwrap();

        let list = db.get_newsletters(USER).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(&*list[0].title, "Mine");
    }

    #[tokio::test]
    async fn test_unread_count_excludes_read_and_archived() {
        let db = test_db().await;
        let a = db
            .insert_newsletter(USER, &test_newsletter("A", None, 1))
            .await
            .unwrap();
        let b = db
            .insert_newsletter(USER, &test_newsletter("B", None, 2))
            .await
            .unwrap();
        db.insert_newsletter(USER, &test_newsletter("C", None, 3))
            .await
            .unwrap();

        db.update_newsletter_fields(USER, &[a], &NewsletterFields::read(true))
            .await
            .unwrap();
        db.update_newsletter_fields(USER, &[b], &NewsletterFields::archived(true))
            .await
            .unwrap();

        assert_eq!(db.get_unread_count(USER).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_update_leaves_other_fields() {
        let db = test_db().await;
        let id = db
            .insert_newsletter(USER, &test_newsletter("A", None, 1))
            .await
            .unwrap();

        db.update_newsletter_fields(USER, &[id], &NewsletterFields::liked(true))
            .await
            .unwrap();
        db.update_newsletter_fields(USER, &[id], &NewsletterFields::read(true))
            .await
            .unwrap();

        let n = &db.get_newsletters(USER).await.unwrap()[0];
        assert!(n.is_liked);
        assert!(n.is_read);
        assert!(!n.is_archived);
    }

    #[tokio::test]
    async fn test_update_is_idempotent_and_counts_existing_rows() {
        let db = test_db().await;
        let id = db
            .insert_newsletter(USER, &test_newsletter("A", None, 1))
            .await
            .unwrap();

        let first = db
            .update_newsletter_fields(USER, &[id], &NewsletterFields::read(true))
            .await
            .unwrap();
        let second = db
            .update_newsletter_fields(USER, &[id], &NewsletterFields::read(true))
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);

        let missing = db
            .update_newsletter_fields(USER, &[id + 100], &NewsletterFields::read(true))
            .await
            .unwrap();
        assert_eq!(missing, 0);
    }

    #[tokio::test]
    async fn test_delete_newsletters() {
        let db = test_db().await;
        let a = db
            .insert_newsletter(USER, &test_newsletter("A", None, 1))
            .await
            .unwrap();
        let b = db
            .insert_newsletter(USER, &test_newsletter("B", None, 2))
            .await
            .unwrap();

        assert_eq!(db.delete_newsletters(USER, &[a]).await.unwrap(), 1);
        assert_eq!(db.delete_newsletters(USER, &[a]).await.unwrap(), 0);

        let list = db.get_newsletters(USER).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, b);
    }

    #[tokio::test]
    async fn test_empty_inputs_are_noops() {
        let db = test_db().await;
        assert_eq!(
            db.update_newsletter_fields(USER, &[], &NewsletterFields::read(true))
                .await
                .unwrap(),
            0
        );
        assert_eq!(db.delete_newsletters(USER, &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writes_ignore_other_users_rows() {
        let db = test_db().await;
        let theirs = db
            .insert_newsletter(2, &test_newsletter("Theirs", None, 1))
            .await
            .unwrap();

        let updated = db
            .update_newsletter_fields(USER, &[theirs], &NewsletterFields::read(true))
            .await
            .unwrap();
        assert_eq!(updated, 0);
        assert_eq!(db.delete_newsletters(USER, &[theirs]).await.unwrap(), 0);

        let list = db.get_newsletters(2).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].is_read);
    }

    #[tokio::test]
    async fn test_unread_count_uses_list_window() {
        let mut db = test_db().await;
        db.list_limit = 2;
        for i in 0..3 {
            db.insert_newsletter(USER, &test_newsletter(&format!("N{i}"), None, i))
                .await
                .unwrap();
        }

        let list = db.get_newsletters(USER).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(db.get_unread_count(USER).await.unwrap(), 2);

        // Reading the oldest row moves nothing: it is outside the window.
        let oldest = db
            .insert_newsletter(USER, &test_newsletter("Oldest", None, -1))
            .await
            .unwrap();
        db.update_newsletter_fields(USER, &[oldest], &NewsletterFields::read(true))
            .await
            .unwrap();
        assert_eq!(db.get_unread_count(USER).await.unwrap(), 2);
    }
}
