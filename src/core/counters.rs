//! Packet/byte counters and the commit-time counter map.
//!
//! The kernel resets every counter when a table is replaced and hands back
//! the values it held. Each staged entry therefore remembers where its
//! counters should come from after the replace ([`CounterMap`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet and byte counters of one rule or built-in chain policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

impl Counters {
    pub const ZERO: Self = Self {
        packets: 0,
        bytes: 0,
    };

    pub const fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }

    pub const fn is_zero(&self) -> bool {
        self.packets == 0 && self.bytes == 0
    }

    #[must_use]
    pub const fn wrapping_add(self, other: Self) -> Self {
        Self {
            packets: self.packets.wrapping_add(other.packets),
            bytes: self.bytes.wrapping_add(other.bytes),
        }
    }

    #[must_use]
    pub const fn wrapping_sub(self, other: Self) -> Self {
        Self {
            packets: self.packets.wrapping_sub(other.packets),
            bytes: self.bytes.wrapping_sub(other.bytes),
        }
    }
}

/// `[packets:bytes]`, as printed by iptables-save
impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.packets, self.bytes)
    }
}

/// Where an entry's counters come from once the kernel has replaced the table.
///
/// `index` is the entry's position in the loaded snapshot, which is also its
/// slot in the counter array the kernel returns from the replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMap {
    /// Structural entry or new rule that starts from zero
    NoMap,
    /// Carry the kernel counters across the replace
    Normal { index: u32 },
    /// Carry only the traffic seen since `original` was zeroed away
    Zeroed { index: u32, original: Counters },
    /// Install the staged value as is
    Set,
}

impl CounterMap {
    /// Map after the entry's counters were zeroed while holding `current`.
    #[must_use]
    pub fn zeroed(self, current: Counters) -> Self {
        match self {
            Self::Normal { index } => Self::Zeroed {
                index,
                original: current,
            },
            other => other,
        }
    }

    /// Counters to push after the replace returned `previous`.
    pub fn resolve(&self, previous: &[Counters], staged: Counters) -> Counters {
        let kernel = |index: u32| {
            previous
                .get(index as usize)
                .copied()
                .unwrap_or_default()
        };
        match *self {
            Self::NoMap => Counters::ZERO,
            Self::Normal { index } => kernel(index),
            Self::Zeroed { index, original } => kernel(index).wrapping_sub(original),
            Self::Set => staged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_save_format() {
        assert_eq!(Counters::new(12, 3400).to_string(), "[12:3400]");
        assert_eq!(Counters::ZERO.to_string(), "[0:0]");
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let big = Counters::new(u64::MAX, 1);
        assert_eq!(big.wrapping_add(Counters::new(1, 1)), Counters::new(0, 2));
        assert_eq!(
            Counters::ZERO.wrapping_sub(Counters::new(1, 0)),
            Counters::new(u64::MAX, 0)
        );
    }

    #[test]
    fn test_zeroing_keeps_index() {
        let map = CounterMap::Normal { index: 4 }.zeroed(Counters::new(10, 1000));
        assert_eq!(
            map,
            CounterMap::Zeroed {
                index: 4,
                original: Counters::new(10, 1000)
            }
        );
        // zeroing twice keeps the first baseline
        assert_eq!(map.zeroed(Counters::ZERO), map);
        assert_eq!(CounterMap::Set.zeroed(Counters::new(1, 1)), CounterMap::Set);
    }

    #[test]
    fn test_resolve() {
        let previous = [Counters::new(5, 500), Counters::new(15, 1500)];
        let staged = Counters::new(7, 7);
        assert_eq!(CounterMap::NoMap.resolve(&previous, staged), Counters::ZERO);
        assert_eq!(
            CounterMap::Normal { index: 1 }.resolve(&previous, staged),
            Counters::new(15, 1500)
        );
        assert_eq!(
            CounterMap::Zeroed {
                index: 1,
                original: Counters::new(10, 1000)
            }
            .resolve(&previous, staged),
            Counters::new(5, 500)
        );
        assert_eq!(CounterMap::Set.resolve(&previous, staged), staged);
        // stale index degrades to zero instead of panicking
        assert_eq!(
            CounterMap::Normal { index: 9 }.resolve(&previous, staged),
            Counters::ZERO
        );
    }
}
