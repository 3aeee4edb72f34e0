//! The symmetric bond map.
//!
//! A live bond between site `a` of one unit and site `b` of another is
//! stored as the two directed entries `a -> b` and `b -> a`, so either end
//! can find its partner in O(1). The canonical direction of a bond is the
//! one whose first endpoint has the smaller unit index; iteration over
//! canonical entries visits every bond exactly once.

use hashbrown::HashMap;

use nck_types::UnitIndex;

/// One end of a bond: a unit and one of its bond sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BondKey {
    /// Index of the unit in the dense state array.
    pub unit: UnitIndex,
    /// Index of the bond site on that unit's type.
    pub site: u32,
}

impl BondKey {
    /// Create a bond key.
    #[must_use]
    pub const fn new(unit: UnitIndex, site: u32) -> Self {
        Self { unit, site }
    }
}

/// Map of all live bonds, with both directed entries per bond.
#[derive(Debug, Default)]
pub struct BondMap {
    map: HashMap<BondKey, BondKey>,
}

impl BondMap {
    /// Create an empty bond map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The partner of the given site, if it is bonded.
    #[must_use]
    pub fn lookup(&self, key: BondKey) -> Option<BondKey> {
        self.map.get(&key).copied()
    }

    /// Whether the given site participates in a bond.
    #[must_use]
    pub fn is_bonded(&self, key: BondKey) -> bool {
        self.map.contains_key(&key)
    }

    /// Insert a new bond as both directed entries.
    pub fn insert_pair(&mut self, a: BondKey, b: BondKey) {
        debug_assert_ne!(a.unit, b.unit, "bond must connect distinct units");
        self.map.insert(a, b);
        self.map.insert(b, a);
    }

    /// Remove both directions of a bond. Returns whether the bond existed.
    pub fn remove_pair(&mut self, a: BondKey, b: BondKey) -> bool {
        let removed = self.map.remove(&a).is_some();
        self.map.remove(&b);
        removed
    }

    /// Remove the bond ending at `key`, both directions. Returns the former
    /// partner.
    pub fn remove_at(&mut self, key: BondKey) -> Option<BondKey> {
        let partner = self.map.remove(&key)?;
        self.map.remove(&partner);
        Some(partner)
    }

    /// Number of bonds (not directed entries).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len() / 2
    }

    /// Whether the map holds no bonds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove all bonds.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterate every bond exactly once, as its canonical
    /// `(smaller unit, larger unit)` entry pair.
    pub fn iter_canonical(&self) -> impl Iterator<Item = (BondKey, BondKey)> + '_ {
        self.map
            .iter()
            .filter(|(a, b)| a.unit < b.unit)
            .map(|(a, b)| (*a, *b))
    }

    /// Iterate all directed entries.
    pub fn iter_directed(&self) -> impl Iterator<Item = (BondKey, BondKey)> + '_ {
        self.map.iter().map(|(a, b)| (*a, *b))
    }

    /// Debug check: every directed entry has its mirror.
    pub fn check_symmetry(&self) {
        for (a, b) in &self.map {
            debug_assert_eq!(
                self.map.get(b),
                Some(a),
                "bond entry {a:?} -> {b:?} has no mirror"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_symmetric() {
        let mut bonds = BondMap::new();
        let a = BondKey::new(0, 1);
        let b = BondKey::new(3, 0);
        bonds.insert_pair(a, b);
        assert_eq!(bonds.lookup(a), Some(b));
        assert_eq!(bonds.lookup(b), Some(a));
        assert_eq!(bonds.len(), 1);
        bonds.check_symmetry();
    }

    #[test]
    fn canonical_iteration_visits_each_bond_once() {
        let mut bonds = BondMap::new();
        bonds.insert_pair(BondKey::new(0, 0), BondKey::new(1, 0));
        bonds.insert_pair(BondKey::new(5, 2), BondKey::new(2, 1));
        let canonical: Vec<_> = bonds.iter_canonical().collect();
        assert_eq!(canonical.len(), 2);
        for (a, b) in canonical {
            assert!(a.unit < b.unit);
        }
    }

    #[test]
    fn remove_at_clears_both_directions() {
        let mut bonds = BondMap::new();
        let a = BondKey::new(0, 0);
        let b = BondKey::new(1, 0);
        bonds.insert_pair(a, b);
        assert_eq!(bonds.remove_at(b), Some(a));
        assert!(bonds.is_empty());
        assert!(!bonds.is_bonded(a));
    }
}
