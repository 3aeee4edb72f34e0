//! Bounded multi-producer request queue, drained once per step.

use std::mem;
use std::sync::Mutex;

use thiserror::Error;

use crate::request::UiRequest;

/// Failure to enqueue a request.
///
/// Producers treat this as fatal for their peer: a client that overruns the
/// queue has its session dropped rather than its requests silently lost.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue has reached its capacity; the drainer is not keeping up.
    #[error("request queue full ({capacity} pending)")]
    Full {
        /// Configured queue capacity.
        capacity: usize,
    },
}

/// MPSC FIFO of pending UI requests.
///
/// Producers append under a short critical section; the simulation thread
/// drains the whole queue atomically once per step by swapping the backing
/// vector, so causally later requests always observe earlier ones.
#[derive(Debug)]
pub struct RequestQueue {
    pending: Mutex<Vec<UiRequest>>,
    capacity: usize,
}

impl RequestQueue {
    /// Default capacity; generous against bursts, small against runaway
    /// producers.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a queue with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a queue holding at most `capacity` pending requests.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Append a request in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] when the queue is at capacity.
    pub fn push(&self, request: UiRequest) -> Result<(), EnqueueError> {
        let mut pending = self.pending.lock().expect("request queue poisoned");
        if pending.len() >= self.capacity {
            return Err(EnqueueError::Full {
                capacity: self.capacity,
            });
        }
        pending.push(request);
        Ok(())
    }

    /// Swap out every pending request into `out` (cleared first).
    ///
    /// The critical section is a single vector swap, so producers are never
    /// blocked behind request processing.
    pub fn drain_into(&self, out: &mut Vec<UiRequest>) {
        out.clear();
        let mut pending = self.pending.lock().expect("request queue poisoned");
        mem::swap(&mut *pending, out);
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use nck_types::PickId;

    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let queue = RequestQueue::new();
        for i in 1..=3 {
            queue
                .push(UiRequest::Release {
                    pick_id: PickId(i),
                })
                .unwrap();
        }
        let mut out = Vec::new();
        queue.drain_into(&mut out);
        let ids: Vec<u16> = out
            .iter()
            .map(|r| match r {
                UiRequest::Release { pick_id } => pick_id.0,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, [1, 2, 3]);

        queue.drain_into(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_when_full() {
        let queue = RequestQueue::with_capacity(1);
        queue
            .push(UiRequest::Copy { pick_id: PickId(1) })
            .unwrap();
        assert!(matches!(
            queue.push(UiRequest::Copy { pick_id: PickId(2) }),
            Err(EnqueueError::Full { capacity: 1 })
        ));
    }
}
