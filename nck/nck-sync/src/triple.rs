//! Versioned triple buffer for state snapshots.
//!
//! Three slots and a monotonic atomic write position connect the single
//! writer (the simulation thread) to its readers without blocking either
//! side for more than a slot clone: the writer stages into the slot the
//! position maps to, then publishes with a release-store of the advanced
//! position; readers acquire-load the position and take an `Arc` clone of
//! the newest slot. Three slots guarantee that a reader holding one
//! snapshot, the writer staging the next, and the parked most-recent slot
//! never collide. Readers always observe the freshest published snapshot;
//! intermediate snapshots may be skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Number of slots. Fixed by the collision argument above.
const SLOTS: usize = 3;

type Slot<T> = Option<(u64, Arc<T>)>;

/// The shared triple buffer.
#[derive(Debug)]
pub struct SnapshotBuffer<T> {
    /// Each slot holds the write position at which it was filled, so a
    /// reader can detect that a slot was overwritten between its position
    /// load and its lock acquisition.
    slots: [Mutex<Slot<T>>; SLOTS],
    write_pos: AtomicU64,
}

impl<T> Default for SnapshotBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SnapshotBuffer<T> {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
            write_pos: AtomicU64::new(0),
        }
    }

    /// Publish a new snapshot.
    ///
    /// Returns the evicted snapshot, which the writer may reclaim (via
    /// `Arc::try_unwrap`) to reuse its allocation for the next staging pass.
    pub fn publish(&self, value: Arc<T>) -> Option<Arc<T>> {
        let pos = self.write_pos.load(Ordering::Relaxed);
        let slot_index = (pos as usize) % SLOTS;
        let evicted = {
            let mut slot = self.slots[slot_index].lock().expect("snapshot slot poisoned");
            let previous = slot.take().map(|(_, arc)| arc);
            *slot = Some((pos, value));
            previous
        };
        // Release: slot contents become visible before readers observe the
        // advanced position.
        self.write_pos.store(pos + 1, Ordering::Release);
        evicted
    }

    /// The most recently published snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<T>> {
        self.latest_tagged().map(|(_, arc)| arc)
    }

    fn latest_tagged(&self) -> Option<(u64, Arc<T>)> {
        let pos = self.write_pos.load(Ordering::Acquire);
        if pos == 0 {
            return None;
        }
        let target = pos - 1;
        let slot = self.slots[(target as usize) % SLOTS]
            .lock()
            .expect("snapshot slot poisoned");
        match slot.as_ref() {
            Some((tag, arc)) if *tag == target => Some((target, Arc::clone(arc))),
            // The writer lapped us between the position load and the lock;
            // the slot now stages a newer snapshot. Retry from the caller.
            _ => None,
        }
    }

    /// Create a reader cursor over this buffer.
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> SnapshotReader<T> {
        SnapshotReader {
            buffer: Arc::clone(self),
            locked: None,
            locked_pos: 0,
        }
    }
}

/// A reader's cursor: holds the snapshot it most recently locked.
#[derive(Debug)]
pub struct SnapshotReader<T> {
    buffer: Arc<SnapshotBuffer<T>>,
    locked: Option<Arc<T>>,
    locked_pos: u64,
}

impl<T> SnapshotReader<T> {
    /// Lock the most recent snapshot. Returns `true` if it is newer than
    /// the one previously locked by this reader.
    pub fn lock_newest(&mut self) -> bool {
        loop {
            let pos = self.buffer.write_pos.load(Ordering::Acquire);
            if pos == 0 {
                return false;
            }
            if self.locked.is_some() && pos - 1 == self.locked_pos {
                return false;
            }
            match self.buffer.latest_tagged() {
                Some((tag, arc)) => {
                    let newer = self.locked.is_none() || tag > self.locked_pos;
                    self.locked = Some(arc);
                    self.locked_pos = tag;
                    return newer;
                }
                // Lapped mid-acquire; the buffer has something newer, try
                // again.
                None => continue,
            }
        }
    }

    /// The snapshot locked by the last successful [`lock_newest`] call.
    ///
    /// [`lock_newest`]: Self::lock_newest
    #[must_use]
    pub fn locked(&self) -> Option<&Arc<T>> {
        self.locked.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_sees_freshest_snapshot_only() {
        let buffer = Arc::new(SnapshotBuffer::new());
        let mut reader = buffer.reader();
        assert!(!reader.lock_newest());

        buffer.publish(Arc::new(1));
        buffer.publish(Arc::new(2));
        buffer.publish(Arc::new(3));
        buffer.publish(Arc::new(4));

        assert!(reader.lock_newest());
        assert_eq!(**reader.locked().unwrap(), 4);
        // Nothing new until the next publish.
        assert!(!reader.lock_newest());

        buffer.publish(Arc::new(5));
        assert!(reader.lock_newest());
        assert_eq!(**reader.locked().unwrap(), 5);
    }

    #[test]
    fn publish_returns_evicted_slot_for_reuse() {
        let buffer: Arc<SnapshotBuffer<Vec<u32>>> = Arc::new(SnapshotBuffer::new());
        assert!(buffer.publish(Arc::new(vec![0])).is_none());
        assert!(buffer.publish(Arc::new(vec![1])).is_none());
        assert!(buffer.publish(Arc::new(vec![2])).is_none());
        // Fourth publish evicts the first slot's value.
        let evicted = buffer.publish(Arc::new(vec![3])).unwrap();
        assert_eq!(*evicted, vec![0]);
        assert!(Arc::try_unwrap(evicted).is_ok());
    }

    #[test]
    fn slow_reader_holds_its_snapshot_while_writer_runs() {
        let buffer = Arc::new(SnapshotBuffer::new());
        let mut reader = buffer.reader();
        buffer.publish(Arc::new(10));
        assert!(reader.lock_newest());
        let held = Arc::clone(reader.locked().unwrap());

        for i in 11..30 {
            buffer.publish(Arc::new(i));
        }
        // The held snapshot is untouched by later publishes.
        assert_eq!(*held, 10);
        assert!(reader.lock_newest());
        assert_eq!(**reader.locked().unwrap(), 29);
    }
}
