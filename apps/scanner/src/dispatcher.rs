use crate::types::BlockRange;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// The shared set of block ranges not yet handed to any endpoint. Endpoints
/// slice jobs off the head on demand; ranges come back via `return_job` when
/// an endpoint gives up. Ranges are disjoint and kept in insertion order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    remaining: Mutex<VecDeque<BlockRange>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `[from, to]` for distribution. Inverted ranges are dropped;
    /// a one-block range (`from == to`) is real work and is kept.
    pub fn add_range(&self, from: u64, to: u64) {
        if from > to {
            return;
        }
        self.lock().push_back(BlockRange::new(from, to));
        debug!(from, to, "range queued for scan");
    }

    /// Atomically slices up to `max_size` blocks off the head range. Returns
    /// `None` when no work remains.
    pub fn take_job(&self, max_size: u64) -> Option<BlockRange> {
        let mut remaining = self.lock();
        let head = remaining.front_mut()?;
        let end = head.to.min(head.from.saturating_add(max_size.max(1) - 1));
        let job = BlockRange::new(head.from, end);
        if end >= head.to {
            remaining.pop_front();
        } else {
            head.from = end + 1;
        }
        Some(job)
    }

    /// Re-inserts a range at the front so another endpoint picks it up next.
    pub fn return_job(&self, range: BlockRange) {
        debug!(range = %range, "job returned to dispatcher");
        self.lock().push_front(range);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn remaining_blocks(&self) -> u64 {
        self.lock().iter().map(BlockRange::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<BlockRange>> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
