//! Manual ordering of the reading queue.
//!
//! A gesture arrives as the complete desired order of queue entry ids. The
//! queue is rewritten to dense positions `0..n` in that order right away,
//! then, after a short debounce, submitted as one atomic reorder. A gesture
//! that arrives during the debounce supersedes the pending one, which never
//! reaches the store. Rollback always returns to the last settled queue, so
//! superseding gestures inherit the snapshot of the gesture they replace.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::{lock, Engine, EngineError, Result};
use crate::cache::{CacheSnapshot, CacheValue, QueryKey, WriteHold};
use crate::remote::RemoteStore;
use crate::storage::{QueueEntry, QueuePosition};

/// Assign positions `0..n` following `order`.
pub fn dense_positions(order: &[i64]) -> Vec<QueuePosition> {
    order
        .iter()
        .zip(0..)
        .map(|(&id, position)| QueuePosition { id, position })
        .collect()
}

/// Check that `desired` lists every entry of `current` exactly once.
pub fn validate_permutation(current: &[QueueEntry], desired: &[i64]) -> Result<()> {
    if desired.len() != current.len() {
        return Err(EngineError::validation(format!(
            "reorder lists {} entries but the queue has {}",
            desired.len(),
            current.len()
        )));
    }
    let known: HashSet<i64> = current.iter().map(|e| e.id).collect();
    let mut seen = HashSet::with_capacity(desired.len());
    for &id in desired {
        if !known.contains(&id) {
            return Err(EngineError::validation(format!(
                "queue entry {id} is not in the reading queue"
            )));
        }
        if !seen.insert(id) {
            return Err(EngineError::validation(format!(
                "queue entry {id} appears more than once"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReorderPhase {
    /// No gesture is waiting on the store.
    Settled,
    /// The cached queue shows `gesture`'s order ahead of the store.
    Optimistic { gesture: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderOutcome {
    /// The store accepted these positions.
    Applied(Vec<QueuePosition>),
    /// A newer gesture replaced this one before it was submitted.
    Superseded,
}

struct PendingReorder {
    gesture: u64,
    settled: CacheSnapshot,
    /// Keeps refetches off the queue until the gesture resolves.
    _hold: WriteHold,
}

#[derive(Default)]
pub(crate) struct ReorderState {
    last_gesture: u64,
    pending: Option<PendingReorder>,
}

impl ReorderState {
    pub(crate) fn reset(&mut self) {
        self.pending = None;
    }

    fn is_current(&self, gesture: u64) -> bool {
        self.pending.as_ref().is_some_and(|p| p.gesture == gesture)
    }
}

fn reordered(queue: &[QueueEntry], positions: &[QueuePosition]) -> Vec<QueueEntry> {
    positions
        .iter()
        .filter_map(|p| {
            queue.iter().find(|e| e.id == p.id).map(|e| QueueEntry {
                position: p.position,
                ..e.clone()
            })
        })
        .collect()
}

impl<R: RemoteStore> Engine<R> {
    pub fn reorder_phase(&self) -> ReorderPhase {
        match &lock(&self.reorder).pending {
            Some(pending) => ReorderPhase::Optimistic {
                gesture: pending.gesture,
            },
            None => ReorderPhase::Settled,
        }
    }

    /// Reorder the reading queue to `desired_entry_ids`.
    ///
    /// Returns once the store has answered, or with
    /// [`ReorderOutcome::Superseded`] if a newer gesture took over first.
    /// A failed reorder is not retried.
    pub async fn reorder_queue(&self, desired_entry_ids: &[i64]) -> Result<ReorderOutcome> {
        let user_id = self.require_user()?;
        let current = self.reading_queue().await?;
        validate_permutation(&current, desired_entry_ids)?;
        if let Some(entry) = current.iter().find(|e| e.is_provisional()) {
            return Err(EngineError::validation(format!(
                "newsletter {} is still being added to the reading queue",
                entry.newsletter_id
            )));
        }

        let key = QueryKey::reading_queue(user_id);
        let positions = dense_positions(desired_entry_ids);
        let gesture = {
            let mut state = lock(&self.reorder);
            state.last_gesture += 1;
            let gesture = state.last_gesture;

            self.cache.cancel_pending(&key);
            let settled = match state.pending.take() {
                Some(previous) => {
                    tracing::warn!(
                        superseded = previous.gesture,
                        gesture,
                        "Reorder superseded by a newer gesture"
                    );
                    previous.settled
                }
                None => self.cache.snapshot(&[key]),
            };
            let hold = self.cache.hold(&[key]);
            self.cache.set(
                key,
                CacheValue::ReadingQueue(Arc::new(reordered(&current, &positions))),
            );
            state.pending = Some(PendingReorder {
                gesture,
                settled,
                _hold: hold,
            });
            gesture
        };
        tracing::debug!(gesture, entries = positions.len(), "Applied optimistic reorder");

        tokio::time::sleep(self.config.reorder_debounce).await;
        if !lock(&self.reorder).is_current(gesture) {
            return Ok(ReorderOutcome::Superseded);
        }

        let result = self.remote.reorder_queue(user_id, &positions).await;

        let pending = {
            let mut state = lock(&self.reorder);
            if state.is_current(gesture) {
                state.pending.take()
            } else {
                None
            }
        };
        let outcome = match (result, pending) {
            (Ok(()), _) => {
                tracing::info!(gesture, entries = positions.len(), "Reorder persisted");
                Ok(ReorderOutcome::Applied(positions))
            }
            (Err(source), Some(pending)) => {
                self.cache.restore(&pending.settled);
                tracing::error!(gesture, error = %source, "Reorder failed, restored settled queue");
                Err(EngineError::RemoteWrite {
                    action: "reorder reading queue",
                    source,
                })
            }
            (Err(source), None) => {
                tracing::error!(gesture, error = %source, "Reorder failed after being superseded");
                Err(EngineError::RemoteWrite {
                    action: "reorder reading queue",
                    source,
                })
            }
        };
        // Any hold taken for this gesture is released by now.
        self.cache.invalidate(&key);
        self.settle_after_mutation().await;
        outcome
    }
}
