//! Count maintenance for the derived aggregates.
//!
//! The unread counter counts newsletters that are neither read nor archived;
//! a source's count covers its non-archived newsletters. Instead of
//! recounting, each newsletter transition yields a signed delta that is added
//! to the cached aggregate with a floor of zero. The result is an
//! approximation until the next refetch of the aggregate.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{CacheBatch, CacheValue, QueryKey};
use crate::storage::Newsletter;

/// Whether `newsletter` contributes to the unread counter.
pub fn counts_as_unread(newsletter: &Newsletter) -> bool {
    !newsletter.is_read && !newsletter.is_archived
}

/// Whether `newsletter` contributes to its source's count.
pub fn counts_for_source(newsletter: &Newsletter) -> bool {
    !newsletter.is_archived
}

/// -1, 0 or +1 for a predicate going from `was` to `is`.
pub fn predicate_delta(was: bool, is: bool) -> i64 {
    i64::from(is) - i64::from(was)
}

/// `max(0, current + delta)`.
pub fn clamped_add(current: i64, delta: i64) -> i64 {
    current.saturating_add(delta).max(0)
}

/// Net change to every aggregate caused by one or more record transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateDelta {
    pub unread: i64,
    /// Keyed by source id; zero entries are never stored.
    pub sources: BTreeMap<i64, i64>,
}

impl AggregateDelta {
    /// Delta for one newsletter going from `before` to `after`.
    /// `after == None` means the newsletter was deleted.
    pub fn between(before: &Newsletter, after: Option<&Newsletter>) -> Self {
        let mut delta = Self {
            unread: predicate_delta(
                counts_as_unread(before),
                after.is_some_and(counts_as_unread),
            ),
            sources: BTreeMap::new(),
        };
        if let Some(source_id) = before.source_id {
            if counts_for_source(before) {
                delta.add_source(source_id, -1);
            }
        }
        if let Some(after) = after {
            if let Some(source_id) = after.source_id {
                if counts_for_source(after) {
                    delta.add_source(source_id, 1);
                }
            }
        }
        delta
    }

    fn add_source(&mut self, source_id: i64, delta: i64) {
        let entry = self.sources.entry(source_id).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            self.sources.remove(&source_id);
        }
    }

    pub fn merge(&mut self, other: &AggregateDelta) {
        self.unread += other.unread;
        for (&source_id, &delta) in &other.sources {
            self.add_source(source_id, delta);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.unread == 0 && self.sources.is_empty()
    }

    /// Add this delta into the cached aggregates of `user_id`.
    ///
    /// Aggregates that are not cached are left alone; the next read fetches
    /// them fresh anyway.
    pub fn apply(&self, batch: &mut CacheBatch<'_>, user_id: i64) {
        if self.unread != 0 {
            batch.update(&QueryKey::unread_count(user_id), |value| match value {
                CacheValue::UnreadCount(count) => {
                    CacheValue::UnreadCount(clamped_add(count, self.unread))
                }
                other => other,
            });
        }
        if !self.sources.is_empty() {
            batch.update(&QueryKey::sources(user_id), |value| match value {
                CacheValue::Sources(mut sources) => {
                    for source in Arc::make_mut(&mut sources).iter_mut() {
                        if let Some(&delta) = self.sources.get(&source.id) {
                            source.newsletter_count = clamped_add(source.newsletter_count, delta);
                        }
                    }
                    CacheValue::Sources(sources)
                }
                other => other,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::storage::Source;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn newsletter(id: i64, source_id: Option<i64>, is_read: bool, is_archived: bool) -> Newsletter {
        Newsletter {
            id,
            user_id: 1,
            title: Arc::from("Issue"),
            source_id,
            is_read,
            is_liked: false,
            is_archived,
            received_at: id,
            updated_at: 0,
            tags: Vec::new(),
        }
    }

    fn source(id: i64, newsletter_count: i64) -> Source {
        Source {
            id,
            user_id: 1,
            name: Arc::from(format!("source-{id}")),
            newsletter_count,
        }
    }

    #[test]
    fn test_predicate_delta() {
        assert_eq!(predicate_delta(false, true), 1);
        assert_eq!(predicate_delta(true, false), -1);
        assert_eq!(predicate_delta(true, true), 0);
        assert_eq!(predicate_delta(false, false), 0);
    }

    #[test]
    fn test_clamped_add_never_negative() {
        assert_eq!(clamped_add(0, -1), 0);
        assert_eq!(clamped_add(3, -1), 2);
        assert_eq!(clamped_add(3, 2), 5);
    }

    #[test]
    fn test_mark_read_decrements_unread_only() {
        let before = newsletter(1, Some(7), false, false);
        let after = before.with_fields(&crate::storage::NewsletterFields::read(true));
        let delta = AggregateDelta::between(&before, Some(&after));
        assert_eq!(delta.unread, -1);
        assert!(delta.sources.is_empty());
    }

    #[test]
    fn test_archive_unread_decrements_both() {
        let before = newsletter(1, Some(7), false, false);
        let after = newsletter(1, Some(7), false, true);
        let delta = AggregateDelta::between(&before, Some(&after));
        assert_eq!(delta.unread, -1);
        assert_eq!(delta.sources, BTreeMap::from([(7, -1)]));
    }

    #[test]
    fn test_unarchive_read_item_does_not_restore_unread() {
        let before = newsletter(1, Some(7), true, true);
        let after = newsletter(1, Some(7), true, false);
        let delta = AggregateDelta::between(&before, Some(&after));
        assert_eq!(delta.unread, 0);
        assert_eq!(delta.sources, BTreeMap::from([(7, 1)]));
    }

    #[test]
    fn test_delete_counts_as_leaving_every_aggregate() {
        let before = newsletter(1, Some(7), false, false);
        let delta = AggregateDelta::between(&before, None);
        assert_eq!(delta.unread, -1);
        assert_eq!(delta.sources, BTreeMap::from([(7, -1)]));

        let archived = newsletter(2, Some(7), false, true);
        assert!(AggregateDelta::between(&archived, None).is_zero());
    }

    #[test]
    fn test_merge_drops_cancelled_sources() {
        let mut delta = AggregateDelta {
            unread: 1,
            sources: BTreeMap::from([(7, 1)]),
        };
        delta.merge(&AggregateDelta {
            unread: -1,
            sources: BTreeMap::from([(7, -1), (8, -1)]),
        });
        assert_eq!(delta.unread, 0);
        assert_eq!(delta.sources, BTreeMap::from([(8, -1)]));
    }

    #[test]
    fn test_apply_clamps_cached_aggregates() {
        let cache = CacheStore::new();
        cache.set(QueryKey::unread_count(1), CacheValue::UnreadCount(1));
        cache.set(
            QueryKey::sources(1),
            CacheValue::Sources(Arc::new(vec![source(7, 0), source(8, 5)])),
        );

        let delta = AggregateDelta {
            unread: -2,
            sources: BTreeMap::from([(7, -1), (8, -1)]),
        };
        cache.batch(|batch| delta.apply(batch, 1));

        assert_eq!(
            cache.get(&QueryKey::unread_count(1)),
            Some(CacheValue::UnreadCount(0))
        );
        assert_eq!(
            cache.get(&QueryKey::sources(1)),
            Some(CacheValue::Sources(Arc::new(vec![source(7, 0), source(8, 4)])))
        );
    }

    #[test]
    fn test_apply_skips_uncached_aggregates() {
        let cache = CacheStore::new();
        let delta = AggregateDelta {
            unread: 1,
            sources: BTreeMap::new(),
        };
        cache.batch(|batch| delta.apply(batch, 1));
        assert!(cache.get(&QueryKey::unread_count(1)).is_none());
    }

    fn recount(list: &[Newsletter]) -> (i64, BTreeMap<i64, i64>) {
        let unread = list.iter().filter(|n| counts_as_unread(n)).count() as i64;
        let mut sources = BTreeMap::new();
        for n in list.iter().filter(|n| counts_for_source(n)) {
            if let Some(source_id) = n.source_id {
                *sources.entry(source_id).or_insert(0) += 1;
            }
        }
        (unread, sources)
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        /// Starting from exact counts, accumulated deltas track a full recount.
        #[test]
        fn deltas_track_recount(
            initial in prop::collection::vec((0..3i64, any::<bool>(), any::<bool>()), 1..12),
            steps in prop::collection::vec((0..12usize, any::<bool>(), any::<bool>()), 0..40),
        ) {
            let mut list: Vec<Newsletter> = initial
                .iter()
                .enumerate()
                .map(|(i, &(source, read, archived))| {
                    newsletter(i as i64, Some(source), read, archived)
                })
                .collect();
            let (mut unread, mut sources) = recount(&list);

            for (idx, read, archived) in steps {
                let idx = idx % list.len();
                let before = list[idx].clone();
                let after = newsletter(before.id, before.source_id, read, archived);
                let delta = AggregateDelta::between(&before, Some(&after));

                unread = clamped_add(unread, delta.unread);
                for (source_id, d) in &delta.sources {
                    let count = sources.entry(*source_id).or_insert(0);
                    *count = clamped_add(*count, *d);
                }
                sources.retain(|_, c| *c != 0);
                list[idx] = after;
            }

            let (expected_unread, expected_sources) = recount(&list);
            prop_assert_eq!(unread, expected_unread);
            prop_assert_eq!(sources, expected_sources);
        }

        #[test]
        fn same_state_is_zero_delta(source in 0..3i64, read in any::<bool>(), archived in any::<bool>()) {
            let n = newsletter(1, Some(source), read, archived);
            prop_assert!(AggregateDelta::between(&n, Some(&n)).is_zero());
        }
    }
}
