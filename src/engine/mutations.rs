use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::optimistic::Applied;
use super::{Engine, EngineError, MutationReport, Result};
use crate::aggregate::AggregateDelta;
use crate::cache::{queue_order, upsert_in_list, CacheBatch, CacheValue, Entity, QueryKey};
use crate::remote::RemoteStore;
use crate::storage::{Newsletter, NewsletterFields, QueueEntry, Tag};

// ============================================================================
// Cache Helpers
// ============================================================================

/// The freshest cached copy of newsletter `id` across every list.
fn find_cached(batch: &CacheBatch<'_>, lists: &[QueryKey], id: i64) -> Option<Newsletter> {
    lists
        .iter()
        .filter_map(|key| batch.get(key)?.as_newsletters())
        .filter_map(|list| list.iter().find(|n| n.id == id))
        .max_by_key(|n| n.updated_at)
        .cloned()
}

/// Put `updated` into every list, following each list's filter.
fn replace_in_lists(batch: &mut CacheBatch<'_>, lists: &[QueryKey], updated: &Newsletter) {
    for key in lists {
        let QueryKey::Newsletters { filter, .. } = key else {
            continue;
        };
        let affected = batch
            .get(key)
            .and_then(CacheValue::as_newsletters)
            .is_some_and(|list| filter.matches(updated) || list.iter().any(|n| n.id == updated.id));
        if !affected {
            continue;
        }
        batch.update(key, |value| match value {
            CacheValue::Newsletters(mut list) => {
                upsert_in_list(Arc::make_mut(&mut list), filter, updated);
                CacheValue::Newsletters(list)
            }
            other => other,
        });
    }
}

fn remove_from_lists(batch: &mut CacheBatch<'_>, lists: &[QueryKey], ids: &HashSet<i64>) {
    for key in lists {
        let affected = batch
            .get(key)
            .and_then(CacheValue::as_newsletters)
            .is_some_and(|list| list.iter().any(|n| ids.contains(&n.id)));
        if !affected {
            continue;
        }
        batch.update(key, |value| match value {
            CacheValue::Newsletters(mut list) => {
                Arc::make_mut(&mut list).retain(|n| !ids.contains(&n.id));
                CacheValue::Newsletters(list)
            }
            other => other,
        });
    }
}

fn update_queue(
    batch: &mut CacheBatch<'_>,
    key: &QueryKey,
    f: impl FnOnce(&mut Vec<QueueEntry>),
) -> bool {
    batch.update(key, |value| match value {
        CacheValue::ReadingQueue(mut queue) => {
            f(Arc::make_mut(&mut queue));
            CacheValue::ReadingQueue(queue)
        }
        other => other,
    })
}

/// Forward step for read/liked/archived changes on `ids`.
fn apply_fields(
    batch: &mut CacheBatch<'_>,
    user_id: i64,
    lists: &[QueryKey],
    ids: &[i64],
    fields: &NewsletterFields,
) -> Applied {
    let mut applied = Applied::default();
    for &id in ids {
        // Records the cache does not hold contribute no delta.
        let Some(before) = find_cached(batch, lists, id) else {
            continue;
        };
        let after = before.with_fields(fields);
        applied.delta.merge(&AggregateDelta::between(&before, Some(&after)));
        applied.matched += 1;
        replace_in_lists(batch, lists, &after);
    }
    applied.delta.apply(batch, user_id);
    applied
}

fn apply_delete(
    batch: &mut CacheBatch<'_>,
    user_id: i64,
    lists: &[QueryKey],
    ids: &[i64],
) -> Applied {
    let mut applied = Applied::default();
    for &id in ids {
        if let Some(before) = find_cached(batch, lists, id) {
            applied.delta.merge(&AggregateDelta::between(&before, None));
            applied.matched += 1;
        }
    }
    let removed: HashSet<i64> = ids.iter().copied().collect();
    remove_from_lists(batch, lists, &removed);
    update_queue(batch, &QueryKey::reading_queue(user_id), |queue| {
        queue.retain(|e| !removed.contains(&e.newsletter_id));
    });
    applied.delta.apply(batch, user_id);
    applied
}

impl<R: RemoteStore> Engine<R> {
    // ========================================================================
    // Read State
    // ========================================================================

    pub async fn mark_read(&self, id: i64) -> Result<MutationReport> {
        self.update_fields("mark newsletter read", &[id], NewsletterFields::read(true))
            .await
    }

    pub async fn mark_unread(&self, id: i64) -> Result<MutationReport> {
        self.update_fields("mark newsletter unread", &[id], NewsletterFields::read(false))
            .await
    }

    pub async fn mark_read_bulk(&self, ids: &[i64]) -> Result<MutationReport> {
        self.update_fields("mark newsletters read", ids, NewsletterFields::read(true))
            .await
    }

    pub async fn mark_unread_bulk(&self, ids: &[i64]) -> Result<MutationReport> {
        self.update_fields("mark newsletters unread", ids, NewsletterFields::read(false))
            .await
    }

    // ========================================================================
    // Likes
    // ========================================================================

    pub async fn set_liked(&self, id: i64, liked: bool) -> Result<MutationReport> {
        self.update_fields("update like", &[id], NewsletterFields::liked(liked))
            .await
    }

    /// Flip the like flag of a cached newsletter.
    pub async fn toggle_like(&self, id: i64) -> Result<MutationReport> {
        let current = self.cached_newsletter(id)?;
        self.set_liked(id, !current.is_liked).await
    }

    pub async fn set_liked_bulk(&self, ids: &[i64], liked: bool) -> Result<MutationReport> {
        self.update_fields("update likes", ids, NewsletterFields::liked(liked))
            .await
    }

    // ========================================================================
    // Archive
    // ========================================================================

    pub async fn archive(&self, id: i64) -> Result<MutationReport> {
        self.update_fields("archive newsletter", &[id], NewsletterFields::archived(true))
            .await
    }

    pub async fn unarchive(&self, id: i64) -> Result<MutationReport> {
        self.update_fields("unarchive newsletter", &[id], NewsletterFields::archived(false))
            .await
    }

    pub async fn toggle_archive(&self, id: i64) -> Result<MutationReport> {
        let current = self.cached_newsletter(id)?;
        if current.is_archived {
            self.unarchive(id).await
        } else {
            self.archive(id).await
        }
    }

    pub async fn archive_bulk(&self, ids: &[i64]) -> Result<MutationReport> {
        self.update_fields("archive newsletters", ids, NewsletterFields::archived(true))
            .await
    }

    pub async fn unarchive_bulk(&self, ids: &[i64]) -> Result<MutationReport> {
        self.update_fields("unarchive newsletters", ids, NewsletterFields::archived(false))
            .await
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Permanently delete a newsletter, dropping it from every cached list
    /// and from the reading queue.
    pub async fn delete(&self, id: i64) -> Result<MutationReport> {
        self.delete_ids("delete newsletter", &[id]).await
    }

    pub async fn delete_bulk(&self, ids: &[i64]) -> Result<MutationReport> {
        self.delete_ids("delete newsletters", ids).await
    }

    async fn delete_ids(&self, action: &'static str, ids: &[i64]) -> Result<MutationReport> {
        let user_id = self.require_user()?;
        let ids = self.prepare_ids(ids)?;
        if ids.is_empty() {
            return Ok(MutationReport::default());
        }
        let lists = self.cache.keys(user_id, Entity::Newsletters);
        let mut keys = lists.clone();
        keys.extend([
            QueryKey::unread_count(user_id),
            QueryKey::sources(user_id),
            QueryKey::reading_queue(user_id),
        ]);

        let write = async {
            match ids.as_slice() {
                [id] => self.remote.delete_newsletter(user_id, *id).await,
                _ => self.remote.delete_newsletters(user_id, &ids).await,
            }
        };
        let executed = self
            .execute(
                action,
                keys,
                |batch| apply_delete(batch, user_id, &lists, &ids),
                write,
            )
            .await;
        self.settle_after_mutation().await;
        Ok(executed?.report())
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Replace the tag set of a newsletter.
    pub async fn update_tags(&self, newsletter_id: i64, tags: Vec<Tag>) -> Result<MutationReport> {
        let user_id = self.require_user()?;
        if let Some(tag) = tags.iter().find(|t| t.name.trim().is_empty()) {
            return Err(EngineError::validation(format!("tag {} has an empty name", tag.id)));
        }
        let mut seen = HashSet::new();
        let tags: Vec<Tag> = tags.into_iter().filter(|t| seen.insert(t.id)).collect();
        let tag_ids: Vec<i64> = tags.iter().map(|t| t.id).collect();
        let lists = self.cache.keys(user_id, Entity::Newsletters);

        let executed = self
            .execute(
                "update tags",
                lists.clone(),
                |batch| {
                    let mut applied = Applied::default();
                    if let Some(before) = find_cached(batch, &lists, newsletter_id) {
                        replace_in_lists(batch, &lists, &before.with_tags(tags));
                        applied.matched = 1;
                    }
                    applied
                },
                self.remote.set_newsletter_tags(user_id, newsletter_id, &tag_ids),
            )
            .await;
        self.settle_after_mutation().await;
        Ok(executed?.report())
    }

    // ========================================================================
    // Reading Queue
    // ========================================================================

    /// Append a newsletter to the end of the reading queue.
    ///
    /// The cached queue shows a provisional entry until the store returns
    /// the real row.
    pub async fn add_to_queue(&self, newsletter_id: i64) -> Result<MutationReport> {
        let user_id = self.require_user()?;
        let queue = self.reading_queue().await?;
        if queue.iter().any(|e| e.newsletter_id == newsletter_id) {
            return Err(EngineError::validation(format!(
                "newsletter {newsletter_id} is already in the reading queue"
            )));
        }
        let position = queue.iter().map(|e| e.position).max().map_or(0, |p| p + 1);
        let provisional = QueueEntry {
            id: self.provisional_ids.fetch_sub(1, Ordering::Relaxed),
            user_id,
            newsletter_id,
            position,
        };
        let provisional_id = provisional.id;
        let key = QueryKey::reading_queue(user_id);

        let executed = self
            .execute(
                "add to reading queue",
                vec![key],
                |batch| {
                    let inserted = update_queue(batch, &key, |queue| {
                        queue.push(provisional);
                        queue.sort_by(queue_order);
                    });
                    Applied {
                        matched: usize::from(inserted),
                        ..Applied::default()
                    }
                },
                self.remote.insert_queue_entry(user_id, newsletter_id, position),
            )
            .await;

        if let Ok(Some(created)) = executed.as_ref().map(|e| e.written.as_ref()) {
            self.cache.batch(|batch| {
                update_queue(batch, &key, |queue| {
                    if let Some(slot) = queue.iter_mut().find(|e| e.id == provisional_id) {
                        *slot = created.clone();
                    }
                    queue.sort_by(queue_order);
                })
            });
        }
        self.settle_after_mutation().await;
        Ok(executed?.report())
    }

    pub async fn remove_from_queue(&self, newsletter_id: i64) -> Result<MutationReport> {
        let user_id = self.require_user()?;
        let queue = self.reading_queue().await?;
        let entry_id = queue
            .iter()
            .find(|e| e.newsletter_id == newsletter_id)
            .map(|e| e.id)
            .ok_or(EngineError::NotFound {
                entity: "queued newsletter",
                id: newsletter_id,
            })?;
        if entry_id < 0 {
            return Err(EngineError::validation(format!(
                "newsletter {newsletter_id} is still being added to the reading queue"
            )));
        }
        let key = QueryKey::reading_queue(user_id);

        let executed = self
            .execute(
                "remove from reading queue",
                vec![key],
                |batch| {
                    let removed = update_queue(batch, &key, |queue| queue.retain(|e| e.id != entry_id));
                    Applied {
                        matched: usize::from(removed),
                        ..Applied::default()
                    }
                },
                self.remote.delete_queue_entry(user_id, entry_id),
            )
            .await;
        self.settle_after_mutation().await;
        Ok(executed?.report())
    }

    // ========================================================================
    // Shared
    // ========================================================================

    async fn update_fields(
        &self,
        action: &'static str,
        ids: &[i64],
        fields: NewsletterFields,
    ) -> Result<MutationReport> {
        let user_id = self.require_user()?;
        let ids = self.prepare_ids(ids)?;
        if ids.is_empty() {
            return Ok(MutationReport::default());
        }
        let lists = self.cache.keys(user_id, Entity::Newsletters);
        let mut keys = lists.clone();
        keys.extend([QueryKey::unread_count(user_id), QueryKey::sources(user_id)]);

        // Already-applied states still reach the store.
        let write = async {
            match ids.as_slice() {
                [id] => self.remote.write_newsletter_fields(user_id, *id, fields).await,
                _ => self.remote.write_newsletter_fields_bulk(user_id, &ids, fields).await,
            }
        };
        let executed = self
            .execute(
                action,
                keys,
                |batch| apply_fields(batch, user_id, &lists, &ids, &fields),
                write,
            )
            .await;
        self.settle_after_mutation().await;
        Ok(executed?.report())
    }

    /// Deduplicate bulk ids, keeping first-seen order.
    fn prepare_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let mut seen = HashSet::new();
        let ids: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.len() > self.config.max_bulk_ids {
            return Err(EngineError::validation(format!(
                "{} ids exceed the bulk limit of {}",
                ids.len(),
                self.config.max_bulk_ids
            )));
        }
        Ok(ids)
    }

    /// Current cached state of a newsletter, for toggles.
    fn cached_newsletter(&self, id: i64) -> Result<Newsletter> {
        let user_id = self.require_user()?;
        let lists = self.cache.keys(user_id, Entity::Newsletters);
        self.cache
            .batch(|batch| find_cached(batch, &lists, id))
            .ok_or(EngineError::NotFound {
                entity: "newsletter",
                id,
            })
    }
}
