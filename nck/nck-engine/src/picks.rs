//! Pick ledger and pick-id allocation.
//!
//! A pick is a user handle over a set of units whose dynamics are overridden
//! until the pick is released. The ledger maps pick ids to the picked units
//! together with their pose offsets in the pick's frame; the mirrored
//! `pick_id` field on each unit state gives the integrator its O(1)
//! "is this unit picked?" query.

use hashbrown::{HashMap, HashSet};

use nck_types::{PickId, Rotation, UnitIndex, Vector};

/// One picked unit: its index and its pose relative to the pick pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickRecord {
    /// Index of the picked unit in the dense state array.
    pub unit: UnitIndex,
    /// Offset from the pick position to the unit's centre, in the pick frame.
    pub position_offset: Vector,
    /// Offset from the pick orientation to the unit's orientation.
    pub orientation_offset: Rotation,
}

/// Map from pick id to the list of picked units.
#[derive(Debug, Default)]
pub struct PickLedger {
    records: HashMap<PickId, Vec<PickRecord>>,
}

impl PickLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The record list for a pick, if the pick is live.
    #[must_use]
    pub fn get(&self, pick: PickId) -> Option<&[PickRecord]> {
        self.records.get(&pick).map(Vec::as_slice)
    }

    /// Mutable record list for a pick, if the pick is live.
    pub fn get_mut(&mut self, pick: PickId) -> Option<&mut Vec<PickRecord>> {
        self.records.get_mut(&pick)
    }

    /// The record list for a pick, created empty if absent.
    pub fn entry(&mut self, pick: PickId) -> &mut Vec<PickRecord> {
        self.records.entry(pick).or_default()
    }

    /// Whether a pick id is live.
    #[must_use]
    pub fn contains(&self, pick: PickId) -> bool {
        self.records.contains_key(&pick)
    }

    /// Remove a pick and return its records.
    pub fn remove(&mut self, pick: PickId) -> Option<Vec<PickRecord>> {
        self.records.remove(&pick)
    }

    /// Remove one unit from the given pick's record list (swap-remove).
    ///
    /// Used when a unit changes hands between picks; the ledger entry itself
    /// stays, possibly empty.
    pub fn unpick_unit(&mut self, pick: PickId, unit: UnitIndex) {
        if let Some(records) = self.records.get_mut(&pick) {
            if let Some(slot) = records.iter().position(|r| r.unit == unit) {
                records.swap_remove(slot);
            }
        }
    }

    /// Rewrite a unit index in the given pick's records after state-array
    /// compaction moved the unit.
    pub fn reindex_unit(&mut self, pick: PickId, old: UnitIndex, new: UnitIndex) {
        if let Some(records) = self.records.get_mut(&pick) {
            if let Some(record) = records.iter_mut().find(|r| r.unit == old) {
                record.unit = new;
            }
        }
    }

    /// Iterate all live picks.
    pub fn iter(&self) -> impl Iterator<Item = (PickId, &[PickRecord])> + '_ {
        self.records.iter().map(|(id, recs)| (*id, recs.as_slice()))
    }

    /// Drop every pick.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of live picks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no picks are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Allocator of pick ids, shared between producer threads and the engine.
///
/// Ids increase monotonically, skip the zero sentinel, and are retried past
/// ids still live in the ledger after the 16-bit counter wraps. The engine
/// returns ids to the allocator when picks die (release, destroy, load).
#[derive(Debug, Default)]
pub struct PickIdAllocator {
    last: u16,
    live: HashSet<u16>,
}

impl PickIdAllocator {
    /// Create an allocator with no outstanding ids.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next unused nonzero pick id.
    pub fn allocate(&mut self) -> PickId {
        debug_assert!(self.live.len() < usize::from(u16::MAX), "pick id space exhausted");
        loop {
            self.last = self.last.wrapping_add(1);
            if self.last != 0 && self.live.insert(self.last) {
                return PickId(self.last);
            }
        }
    }

    /// Return an id to the pool once its pick is gone.
    pub fn release(&mut self, pick: PickId) {
        self.live.remove(&pick.0);
    }

    /// Mark an externally chosen id as live.
    ///
    /// Create requests carry ids whose point pick found nothing (and hence
    /// already returned to the pool); once such an id gains a ledger entry
    /// it must be protected from reuse again.
    pub fn mark(&mut self, pick: PickId) {
        if pick.is_some() {
            self.live.insert(pick.0);
        }
    }

    /// Return every id to the pool (session reload).
    pub fn clear(&mut self) {
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_skips_zero_and_live_ids() {
        let mut alloc = PickIdAllocator::new();
        assert_eq!(alloc.allocate(), PickId(1));
        assert_eq!(alloc.allocate(), PickId(2));

        // Force a wrap with id 1 still live: 1 must be skipped.
        alloc.last = u16::MAX;
        assert_eq!(alloc.allocate(), PickId(3));

        alloc.release(PickId(1));
        alloc.last = u16::MAX;
        assert_eq!(alloc.allocate(), PickId(1));
    }

    #[test]
    fn unpick_and_reindex() {
        let mut ledger = PickLedger::new();
        let pick = PickId(4);
        ledger.entry(pick).extend([
            PickRecord {
                unit: 0,
                position_offset: Vector::zeros(),
                orientation_offset: Rotation::identity(),
            },
            PickRecord {
                unit: 7,
                position_offset: Vector::zeros(),
                orientation_offset: Rotation::identity(),
            },
        ]);

        ledger.reindex_unit(pick, 7, 3);
        assert!(ledger.get(pick).unwrap().iter().any(|r| r.unit == 3));

        ledger.unpick_unit(pick, 0);
        assert_eq!(ledger.get(pick).unwrap().len(), 1);
    }
}
