use std::hash::Hash;

use foldhash::{HashMap, HashMapExt};
use tokio::time::Instant;

/// Binary min-heap of keys ordered by the instant they last became active.
///
/// The minimum is the key that has been idle for the longest. Ties are broken by insertion order.
///
/// An index map from key to heap position makes removal of an arbitrary key O(log n), which the
/// pool needs when a worker leaves the pool out of idle order.
#[derive(Debug)]
pub struct IdleHeap<K> {
    entries: Vec<HeapEntry<K>>,
    positions: HashMap<K, usize>,
    next_sequence: u64,
}

#[derive(Debug)]
struct HeapEntry<K> {
    key: K,
    active_at: Instant,
    sequence: u64,
}

impl<K> HeapEntry<K> {
    fn precedes(&self, other: &Self) -> bool {
        (self.active_at, self.sequence) < (other.active_at, other.sequence)
    }
}

impl<K> IdleHeap<K>
where
    K: Copy + Eq + Hash,
{
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// The number of keys in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the heap contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the key is in the heap.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.positions.contains_key(&key)
    }

    /// Adds a key that became active at the given instant.
    ///
    /// A key that is already present is repositioned according to the new instant.
    pub fn insert(&mut self, key: K, active_at: Instant) {
        self.remove(key);

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let position = self.entries.len();
        self.entries.push(HeapEntry {
            key,
            active_at,
            sequence,
        });
        self.positions.insert(key, position);
        self.sift_up(position);
    }

    /// Removes a key from any position, returning the instant it was inserted with.
    pub fn remove(&mut self, key: K) -> Option<Instant> {
        let position = self.positions.remove(&key)?;
        let last = self.entries.len().checked_sub(1)?;

        self.entries.swap(position, last);
        let removed = self.entries.pop()?;

        if position < self.entries.len() {
            self.reindex(position);
            self.sift_down(position);
            self.sift_up(position);
        }

        Some(removed.active_at)
    }

    /// The longest-idle key and the instant it became active, without removing it.
    #[must_use]
    pub fn top(&self) -> Option<(K, Instant)> {
        self.entries
            .first()
            .map(|entry| (entry.key, entry.active_at))
    }

    /// Removes and returns the longest-idle key.
    pub fn extract(&mut self) -> Option<(K, Instant)> {
        let (key, active_at) = self.top()?;
        self.remove(key);
        Some((key, active_at))
    }

    /// Removes all keys.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "positions are bounded by the entry count, far below overflow"
    )]
    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;

            if !self.entry(position).precedes(self.entry(parent)) {
                break;
            }

            self.entries.swap(position, parent);
            self.reindex(position);
            self.reindex(parent);
            position = parent;
        }
    }

    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "positions are bounded by the entry count, far below overflow"
    )]
    fn sift_down(&mut self, mut position: usize) {
        let len = self.entries.len();

        loop {
            let left = position * 2 + 1;
            let right = left + 1;
            let mut smallest = position;

            if left < len && self.entry(left).precedes(self.entry(smallest)) {
                smallest = left;
            }

            if right < len && self.entry(right).precedes(self.entry(smallest)) {
                smallest = right;
            }

            if smallest == position {
                break;
            }

            self.entries.swap(position, smallest);
            self.reindex(position);
            self.reindex(smallest);
            position = smallest;
        }
    }

    #[expect(
        clippy::indexing_slicing,
        reason = "heap positions are always derived from the current entry count"
    )]
    fn entry(&self, position: usize) -> &HeapEntry<K> {
        &self.entries[position]
    }

    fn reindex(&mut self, position: usize) {
        if let Some(entry) = self.entries.get(position) {
            self.positions.insert(entry.key, position);
        }
    }
}

impl<K> Default for IdleHeap<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
