//! Bounded-retry block event queue.
//!
//! World-side block changes arrive as events referencing columns that may not
//! be loaded into the cell graph yet. Handlers return "not yet handled" for
//! such transient inconsistency; the event is retried across ticks up to a
//! maximum count, then dropped with a log line. The simulation never aborts
//! over a lost event — a later full-column validation rebuilds the state.

use bevy::math::IVec3;
use std::collections::{HashSet, VecDeque};

use crate::config::constants::MAX_EVENT_RETRIES;

/// A world block change relevant to the fluid graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockEventKind {
    /// A block was placed or changed into a solid/barrier form.
    BlockPlaced,
    /// A block was removed or changed into an open form.
    BlockRemoved,
    /// External request to (re)validate the whole column at this position.
    ColumnInvalidated,
}

/// One queued block event with its retry budget.
#[derive(Debug, Clone, Copy)]
pub struct BlockEvent {
    /// Global block position of the change.
    pub pos: IVec3,
    pub kind: BlockEventKind,
    /// Times this event has already been attempted.
    pub attempts: u32,
}

/// Queue of world block events pending application to the cell graph.
///
/// Deduplicates by (position, kind) so a burst of identical world updates
/// collapses into one validation.
#[derive(Debug, Default)]
pub struct BlockEventQueue {
    pending: VecDeque<BlockEvent>,
    pending_set: HashSet<(IVec3, BlockEventKind)>,
    /// Events dropped after exhausting retries, for diagnostics.
    pub dropped: u64,
}

impl BlockEventQueue {
    /// Queues an event, ignoring duplicates already pending.
    pub fn queue(&mut self, pos: IVec3, kind: BlockEventKind) {
        if self.pending_set.insert((pos, kind)) {
            self.pending.push_back(BlockEvent {
                pos,
                kind,
                attempts: 0,
            });
        }
    }

    /// Takes the next event, if any.
    pub fn pop(&mut self) -> Option<BlockEvent> {
        let event = self.pending.pop_front()?;
        self.pending_set.remove(&(event.pos, event.kind));
        Some(event)
    }

    /// Re-queues an event that could not be handled this tick. Returns false
    /// (and logs) if the retry budget is exhausted and the event was dropped.
    pub fn retry(&mut self, mut event: BlockEvent) -> bool {
        event.attempts += 1;
        if event.attempts >= MAX_EVENT_RETRIES {
            self.dropped += 1;
            log::debug!(
                "[EVENTS] Dropping block event {:?} at {:?} after {} attempts",
                event.kind,
                event.pos,
                event.attempts
            );
            return false;
        }
        if self.pending_set.insert((event.pos, event.kind)) {
            self.pending.push_back(event);
        }
        true
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if no events are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
