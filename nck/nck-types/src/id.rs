//! Identifier newtypes shared by the engine and the protocol.
//!
//! All three identifiers are 16 bits wide on the wire. The zero value is a
//! sentinel in every case: an unpicked unit, an invalid session, and the
//! reserved pick id that allocators must skip.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into the immutable unit-type registry of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitTypeId(pub u16);

impl UnitTypeId {
    /// Create a unit-type id from its raw index.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw index value.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for UnitTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitType({})", self.0)
    }
}

/// Identifier of a simulation session.
///
/// A session spans the era between two state-invalidating events (startup,
/// load). Snapshots carry the session id that produced them; readers detect
/// stale snapshots by comparing against the engine's current id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl SessionId {
    /// The invalid session (no session established yet).
    pub const INVALID: Self = Self(0);

    /// Whether this id denotes a valid session.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The next session id, skipping the invalid sentinel on wrap.
    #[must_use]
    pub const fn next(self) -> Self {
        let n = self.0.wrapping_add(1);
        Self(if n == 0 { 1 } else { n })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

/// Handle identifying a set of picked units.
///
/// Pick ids are allocated per peer; zero is reserved to mean "not picked".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PickId(pub u16);

impl PickId {
    /// The "not picked" sentinel carried by unpicked units.
    pub const NONE: Self = Self(0);

    /// Whether this is a real pick handle.
    #[must_use]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Whether this is the "not picked" sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pick({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_next_skips_invalid() {
        assert_eq!(SessionId(1).next(), SessionId(2));
        assert_eq!(SessionId(u16::MAX).next(), SessionId(1));
        assert!(!SessionId::INVALID.is_valid());
        assert!(SessionId(1).is_valid());
    }
}
