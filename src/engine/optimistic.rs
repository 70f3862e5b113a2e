//! The one executor every cache-writing mutation is built on.
//!
//! A mutation is described by the keys it touches, a forward step applied to
//! those keys inside one cache batch, and the remote write. The inverse of
//! every forward step is the same: put the snapshot back.

use std::future::Future;

use super::{Engine, EngineError, MutationReport, Result};
use crate::aggregate::AggregateDelta;
use crate::cache::{CacheBatch, CacheSnapshot, QueryKey};
use crate::remote::{RemoteError, RemoteStore};

/// What the forward step changed.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub matched: usize,
    pub delta: AggregateDelta,
}

/// Result of a completed optimistic mutation.
pub(crate) struct Executed<T> {
    pub applied: Applied,
    /// `None` when the remote store no longer had the target.
    pub written: Option<T>,
}

impl<T> Executed<T> {
    pub fn report(&self) -> MutationReport {
        match self.written {
            Some(_) => MutationReport {
                matched: self.applied.matched,
                unread_delta: self.applied.delta.unread,
                persisted: true,
            },
            None => MutationReport::default(),
        }
    }
}

impl<R: RemoteStore> Engine<R> {
    /// Run one mutation through the optimistic protocol.
    ///
    /// `write` is not polled until the optimistic state is in the cache. While
    /// it runs the keys are held, so no refetch can land on them. On failure
    /// the snapshot is restored; either way the keys end up invalidated.
    ///
    /// A `NotFound` from the store rolls back like any failure but is not an
    /// error: the cache was behind, and the refetch will drop the record.
    ///
    /// If the session changed while the write was in flight, the cleared
    /// user's entries are not put back.
    pub(crate) async fn execute<T, W>(
        &self,
        action: &'static str,
        keys: Vec<QueryKey>,
        forward: impl FnOnce(&mut CacheBatch<'_>) -> Applied,
        write: W,
    ) -> Result<Executed<T>>
    where
        W: Future<Output = std::result::Result<T, RemoteError>>,
    {
        for key in &keys {
            self.cache.cancel_pending(key);
        }
        let snapshot = self.cache.snapshot(&keys);
        let hold = self.cache.hold(&keys);
        let applied = self.cache.batch(forward);
        tracing::debug!(
            action,
            matched = applied.matched,
            unread_delta = applied.delta.unread,
            "Applied optimistic update"
        );

        let result = write.await;
        drop(hold);

        let outcome = match result {
            Ok(written) => {
                tracing::info!(
                    action,
                    matched = applied.matched,
                    unread_delta = applied.delta.unread,
                    "Mutation persisted"
                );
                Ok(Executed {
                    applied,
                    written: Some(written),
                })
            }
            Err(RemoteError::NotFound { entity, id }) => {
                self.rollback(action, &keys, &snapshot);
                tracing::warn!(action, entity, id, "Target missing from store, rolled back");
                Ok(Executed {
                    applied,
                    written: None,
                })
            }
            Err(source) => {
                self.rollback(action, &keys, &snapshot);
                tracing::error!(action, error = %source, "Remote write failed, rolled back");
                Err(EngineError::RemoteWrite { action, source })
            }
        };

        for key in &keys {
            self.cache.invalidate(key);
        }
        outcome
    }

    fn rollback(&self, action: &'static str, keys: &[QueryKey], snapshot: &CacheSnapshot) {
        let session = self.current_user();
        if keys.iter().any(|key| Some(key.user_id()) != session) {
            tracing::debug!(action, "Session changed during write, skipping rollback");
            return;
        }
        self.cache.restore(snapshot);
    }

    /// Refetch after a mutation when configured to. Read failures here do not
    /// change the mutation's outcome.
    pub(crate) async fn settle_after_mutation(&self) {
        if !self.config.refetch_after_mutation {
            return;
        }
        if let Err(e) = self.settle().await {
            tracing::warn!(error = %e, "Post-mutation refetch failed");
        }
    }
}
