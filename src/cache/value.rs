use std::cmp::Ordering;
use std::sync::Arc;

use super::key::NewsletterFilter;
use crate::storage::{Newsletter, QueueEntry, Source};

/// A cached query result.
///
/// Collections sit behind `Arc` so readers and rollback snapshots share them
/// cheaply; writers go through `Arc::make_mut`, which clones whenever anyone
/// else still holds the old value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Newsletters(Arc<Vec<Newsletter>>),
    UnreadCount(i64),
    Sources(Arc<Vec<Source>>),
    ReadingQueue(Arc<Vec<QueueEntry>>),
}

impl CacheValue {
    pub fn as_newsletters(&self) -> Option<&Arc<Vec<Newsletter>>> {
        match self {
            CacheValue::Newsletters(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_unread_count(&self) -> Option<i64> {
        match self {
            CacheValue::UnreadCount(count) => Some(*count),
            _ => None,
        }
    }

    pub fn as_sources(&self) -> Option<&Arc<Vec<Source>>> {
        match self {
            CacheValue::Sources(sources) => Some(sources),
            _ => None,
        }
    }

    pub fn as_reading_queue(&self) -> Option<&Arc<Vec<QueueEntry>>> {
        match self {
            CacheValue::ReadingQueue(queue) => Some(queue),
            _ => None,
        }
    }
}

/// List order: newest first, ties by id descending.
pub fn newsletter_order(a: &Newsletter, b: &Newsletter) -> Ordering {
    b.received_at
        .cmp(&a.received_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Queue order: position ascending, ties by id.
pub fn queue_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id))
}

/// Build a list value for `filter` out of a full newsletter read.
pub fn filtered_list(all: &[Newsletter], filter: &NewsletterFilter) -> Vec<Newsletter> {
    let mut list: Vec<Newsletter> = all.iter().filter(|n| filter.matches(n)).cloned().collect();
    list.sort_by(newsletter_order);
    list
}

/// Put `updated` into a filtered list in place of the record with the same id.
///
/// A record that still matches keeps its slot; one that stops matching is
/// dropped; one that starts matching is inserted at its sorted position.
/// Returns whether the list changed.
pub fn upsert_in_list(
    list: &mut Vec<Newsletter>,
    filter: &NewsletterFilter,
    updated: &Newsletter,
) -> bool {
    let existing = list.iter().position(|n| n.id == updated.id);
    match (existing, filter.matches(updated)) {
        (Some(idx), true) => {
            list[idx] = updated.clone();
            true
        }
        (Some(idx), false) => {
            list.remove(idx);
            true
        }
        (None, true) => {
            let idx = list
                .binary_search_by(|probe| newsletter_order(probe, updated))
                .unwrap_or_else(|idx| idx);
            list.insert(idx, updated.clone());
            true
        }
        (None, false) => false,
    }
}
