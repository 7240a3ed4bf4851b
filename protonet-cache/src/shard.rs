//! Append-only sharded slot storage.
//!
//! A [`ShardSet`] starts as a single fixed-capacity [`Shard`]. Once that
//! shard is full the set is upgraded to a multi-shard container and a new
//! shard is appended each time the last one fills. Existing slots never
//! move, so an index handed out once stays valid for the life of the set.
//!
//! Index mapping is `shard = index / capacity`, `offset = index % capacity`.
//!
//! Slot occupancy is monotonic: a [`Slot`] can go from empty to occupied
//! but never back. Nothing in this module exposes a way to clear or replace
//! an occupied slot.

/// A single storage slot.
#[derive(Debug, Clone)]
pub struct Slot<T>(Option<T>);

impl<T> Slot<T> {
    /// Creates an empty (reserved) slot.
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Creates an occupied slot.
    pub const fn occupied(value: T) -> Self {
        Self(Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }

    /// Fills an empty slot.
    ///
    /// Returns the value back unchanged if the slot is already occupied.
    pub fn fill(&mut self, value: T) -> Result<&T, T> {
        match self.0 {
            Some(_) => Err(value),
            None => Ok(self.0.insert(value)),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// A fixed-capacity, append-only run of slots.
///
/// Storage grows on demand up to `capacity`; the capacity is a logical
/// bound, not a preallocation.
#[derive(Debug, Clone)]
pub struct Shard<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
}

impl<T> Shard<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn get(&self, offset: usize) -> Option<&Slot<T>> {
        self.slots.get(offset)
    }

    fn fill(&mut self, offset: usize, value: T) -> Result<&T, T> {
        match self.slots.get_mut(offset) {
            Some(slot) => slot.fill(value),
            None => Err(value),
        }
    }
}

/// An ordered collection of shards addressed by a flat index.
#[derive(Debug, Clone)]
pub enum ShardSet<T> {
    /// The initial state: one shard.
    Single(Shard<T>),
    /// Upgraded once the first shard filled up.
    Multi(Vec<Shard<T>>),
}

impl<T> ShardSet<T> {
    pub fn new(shard_capacity: usize) -> Self {
        ShardSet::Single(Shard::new(shard_capacity))
    }

    /// Capacity of each individual shard.
    pub fn shard_capacity(&self) -> usize {
        self.shards()[0].capacity()
    }

    /// Returns all shards in index order.
    pub fn shards(&self) -> &[Shard<T>] {
        match self {
            ShardSet::Single(shard) => std::slice::from_ref(shard),
            ShardSet::Multi(shards) => shards,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards().len()
    }

    /// Total number of slots (empty or occupied).
    pub fn len(&self) -> usize {
        self.shards().iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        let capacity = self.shard_capacity();
        (index / capacity, index % capacity)
    }

    pub fn get(&self, index: usize) -> Option<&Slot<T>> {
        let (shard, offset) = self.locate(index);
        self.shards().get(shard)?.get(offset)
    }

    /// Fills the empty slot at `index`.
    ///
    /// Returns the value back if the slot is occupied or does not exist.
    pub fn fill(&mut self, index: usize, value: T) -> Result<&T, T> {
        let (shard, offset) = self.locate(index);
        let target = match self {
            ShardSet::Single(only) if shard == 0 => only,
            ShardSet::Single(_) => return Err(value),
            ShardSet::Multi(shards) => match shards.get_mut(shard) {
                Some(target) => target,
                None => return Err(value),
            },
        };
        target.fill(offset, value)
    }

    /// Appends a slot and returns its flat index.
    pub fn push(&mut self, slot: Slot<T>) -> usize {
        let index = self.len();
        self.ensure_room();
        self.last_shard_mut().slots.push(slot);
        index
    }

    fn ensure_room(&mut self) {
        let capacity = self.shard_capacity();
        match self {
            ShardSet::Single(shard) if shard.is_full() => {
                let first = std::mem::replace(shard, Shard::new(capacity));
                *self = ShardSet::Multi(vec![first, Shard::new(capacity)]);
                tracing::debug!(capacity, "object cache upgraded to multiple shards");
            }
            ShardSet::Multi(shards) if shards.last().map_or(true, Shard::is_full) => {
                shards.push(Shard::new(capacity));
                tracing::debug!(shards = shards.len(), "object cache shard appended");
            }
            _ => {}
        }
    }

    fn last_shard_mut(&mut self) -> &mut Shard<T> {
        match self {
            ShardSet::Single(shard) => shard,
            ShardSet::Multi(shards) => {
                let last = shards.len() - 1;
                &mut shards[last]
            }
        }
    }

    /// Returns the index of the first empty slot at or after `start`.
    pub fn first_empty_from(&self, start: usize) -> Option<usize> {
        let (first_shard, first_offset) = self.locate(start);
        let capacity = self.shard_capacity();

        for (shard_index, shard) in self.shards().iter().enumerate().skip(first_shard) {
            let from = if shard_index == first_shard { first_offset } else { 0 };
            if let Some(offset) = shard.slots.iter().skip(from).position(Slot::is_empty) {
                return Some(shard_index * capacity + from + offset);
            }
        }
        None
    }

    /// Iterates occupied values with their flat index.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        let capacity = self.shard_capacity();
        self.shards()
            .iter()
            .enumerate()
            .flat_map(move |(shard_index, shard)| {
                shard
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(move |(offset, slot)| {
                        slot.get().map(|value| (shard_index * capacity + offset, value))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_fill_is_monotonic() {
        let mut slot = Slot::empty();
        assert!(slot.is_empty());

        assert_eq!(slot.fill(1), Ok(&1));
        assert!(!slot.is_empty());

        // A second fill is refused and the value handed back.
        assert_eq!(slot.fill(2), Err(2));
        assert_eq!(slot.get(), Some(&1));
    }

    #[test]
    fn test_single_shard_push() {
        let mut set = ShardSet::new(4);
        assert!(set.is_empty());

        for i in 0..4 {
            assert_eq!(set.push(Slot::occupied(i)), i);
        }
        assert_eq!(set.len(), 4);
        assert_eq!(set.shard_count(), 1);
        assert!(matches!(set, ShardSet::Single(_)));
    }

    #[test]
    fn test_upgrade_to_multi_shard() {
        let mut set = ShardSet::new(4);
        for i in 0..10 {
            assert_eq!(set.push(Slot::occupied(i)), i);
        }

        assert!(matches!(set, ShardSet::Multi(_)));
        assert_eq!(set.shard_count(), 3);
        assert_eq!(set.len(), 10);

        for i in 0..10 {
            assert_eq!(set.get(i).and_then(Slot::get), Some(&i));
        }
        assert!(set.get(10).is_none());
    }

    #[test]
    fn test_fill_across_shards() {
        let mut set: ShardSet<u32> = ShardSet::new(2);
        for _ in 0..5 {
            set.push(Slot::empty());
        }

        assert_eq!(set.fill(3, 30), Ok(&30));
        assert_eq!(set.fill(3, 31), Err(31));
        assert_eq!(set.fill(9, 90), Err(90));
        assert_eq!(set.get(3).and_then(Slot::get), Some(&30));
    }

    #[test]
    fn test_first_empty_from() {
        let mut set = ShardSet::new(3);
        set.push(Slot::occupied(0));
        set.push(Slot::empty());
        set.push(Slot::occupied(2));
        set.push(Slot::occupied(3));
        set.push(Slot::empty());

        assert_eq!(set.first_empty_from(0), Some(1));
        assert_eq!(set.first_empty_from(2), Some(4));
        assert_eq!(set.first_empty_from(5), None);

        set.fill(4, 4).unwrap();
        assert_eq!(set.first_empty_from(2), None);
    }

    #[test]
    fn test_occupied_iter() {
        let mut set = ShardSet::new(2);
        set.push(Slot::occupied("a"));
        set.push(Slot::empty());
        set.push(Slot::occupied("c"));

        let items: Vec<_> = set.occupied().collect();
        assert_eq!(items, vec![(0, &"a"), (2, &"c")]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut set = ShardSet::new(0);
        assert_eq!(set.shard_capacity(), 1);
        set.push(Slot::occupied(1));
        set.push(Slot::occupied(2));
        assert_eq!(set.shard_count(), 2);
    }
}
