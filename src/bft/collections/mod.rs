//! This module provides the collection types used throughout the
//! crate, with a faster hash function swapped in, as well as the
//! sender bitmaps used to count distinct votes.

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = ::twox_hash::RandomXxHashBuilder64;

#[cfg(feature = "collections_randomstate_std")]
type RandomState = ::std::collections::hash_map::RandomState;

use crate::bft::communication::NodeId;

/// A map with a faster hashing function.
pub type HashMap<K, V> = ::std::collections::HashMap<K, V, RandomState>;

/// A set with a faster hashing function.
pub type HashSet<K> = ::std::collections::HashSet<K, RandomState>;

/// A map which preserves the insertion order of its keys.
pub type OrderedMap<K, V> = ::linked_hash_map::LinkedHashMap<K, V, RandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashMap` with a custom capacity.
pub fn hash_map_capacity<K, V>(n: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(n, Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: ::std::hash::Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::with_hasher(Default::default())
}

/// A set of voters, held as a 128 bit wide bitmap over replica ids.
///
/// The bitmap makes vote counting idempotent: a replica that
/// equivocates, or a duplicated message, still counts once.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SenderBitmap(u128);

impl SenderBitmap {
    /// The highest replica id representable in the bitmap.
    pub const WIDTH: u32 = 128;

    /// Creates an empty voter set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Adds `id` to the voter set, reporting whether the set changed.
    ///
    /// Ids outside the bitmap width are refused.
    pub fn set(&mut self, id: NodeId) -> bool {
        let id = u32::from(id);
        if id >= Self::WIDTH {
            return false;
        }
        let mask = 1u128 << id;
        let changed = self.0 & mask == 0;
        self.0 |= mask;
        changed
    }

    /// Checks if `id` has already voted.
    pub fn contains(&self, id: NodeId) -> bool {
        let id = u32::from(id);
        id < Self::WIDTH && self.0 & (1u128 << id) != 0
    }

    /// The number of distinct voters in the set.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }
}
