use std::iter::FusedIterator;

use crate::{Error, Result};

/// A doubly-linked list whose nodes live in slots of a growable arena.
///
/// Every push returns a [`NodeHandle`] that stays valid for as long as the value is in the list,
/// which allows O(1) removal of an arbitrary value without searching for it. Links between nodes
/// are slot indexes, not pointers.
///
/// Handles are stamped with a list-wide generation number that is never reused, so a handle for a
/// value that has since been removed will never alias a newer value that happens to occupy the
/// same slot. Such stale handles are rejected with [`Error::NotResident`].
///
/// When the list becomes empty, the slot storage is released.
#[derive(Debug)]
pub struct PooledList<T> {
    slots: Vec<Slot<T>>,

    /// Head of the intrusive freelist threaded through vacant slots. Points out of bounds when
    /// there are no vacant slots.
    next_free_index: usize,

    head: Option<usize>,
    tail: Option<usize>,

    len: usize,

    next_generation: u64,
}

/// Identifies one value stored in a [`PooledList`].
///
/// A handle is only meaningful for the list that issued it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied {
        value: T,
        generation: u64,
        prev: Option<usize>,
        next: Option<usize>,
    },

    Vacant {
        next_free_index: usize,
    },
}

impl<T> PooledList<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_free_index: 0,
            head: None,
            tail: None,
            len: 0,
            next_generation: 0,
        }
    }

    /// The number of values in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list contains no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value before the current front of the list.
    pub fn push_front(&mut self, value: T) -> NodeHandle {
        let old_head = self.head;
        let handle = self.occupy(value, None, old_head);

        match old_head {
            Some(index) => self.set_prev(index, Some(handle.index)),
            None => self.tail = Some(handle.index),
        }
        self.head = Some(handle.index);

        handle
    }

    /// Inserts a value after the current back of the list.
    pub fn push_back(&mut self, value: T) -> NodeHandle {
        let old_tail = self.tail;
        let handle = self.occupy(value, old_tail, None);

        match old_tail {
            Some(index) => self.set_next(index, Some(handle.index)),
            None => self.head = Some(handle.index),
        }
        self.tail = Some(handle.index);

        handle
    }

    /// Handle of the value at the front of the list, if any.
    #[must_use]
    pub fn front(&self) -> Option<NodeHandle> {
        self.head.map(|index| self.handle_at(index))
    }

    /// Handle of the value at the back of the list, if any.
    #[must_use]
    pub fn back(&self) -> Option<NodeHandle> {
        self.tail.map(|index| self.handle_at(index))
    }

    /// Removes and returns the value at the front of the list.
    pub fn pop_front(&mut self) -> Option<T> {
        let front = self.front()?;
        self.remove(front).ok()
    }

    /// Removes and returns the value at the back of the list.
    pub fn pop_back(&mut self) -> Option<T> {
        let back = self.back()?;
        self.remove(back).ok()
    }

    /// Whether the handle refers to a value that is still in this list.
    #[must_use]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_some()
    }

    /// The value referenced by the handle, if it is still in this list.
    #[must_use]
    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        match self.slots.get(handle.index) {
            Some(Slot::Occupied {
                value, generation, ..
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Removes the value referenced by the handle in O(1).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotResident`] if the handle does not refer to a value in this list.
    pub fn remove(&mut self, handle: NodeHandle) -> Result<T> {
        if !self.contains(handle) {
            return Err(Error::NotResident);
        }

        let vacant = Slot::Vacant {
            next_free_index: self.next_free_index,
        };

        let Some(slot) = self.slots.get_mut(handle.index) else {
            return Err(Error::NotResident);
        };

        let Slot::Occupied {
            value, prev, next, ..
        } = std::mem::replace(slot, vacant)
        else {
            unreachable!("residency was checked above");
        };

        self.next_free_index = handle.index;

        match prev {
            Some(index) => self.set_next(index, next),
            None => self.head = next,
        }

        match next {
            Some(index) => self.set_prev(index, prev),
            None => self.tail = prev,
        }

        self.len = self
            .len
            .checked_sub(1)
            .expect("a resident value implies a non-zero length");

        if self.len == 0 {
            self.release_storage();
        }

        Ok(value)
    }

    /// Iterates over the values from front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len,
        }
    }

    fn occupy(&mut self, value: T, prev: Option<usize>, next: Option<usize>) -> NodeHandle {
        let generation = self.next_generation;
        self.next_generation = self
            .next_generation
            .checked_add(1)
            .expect("generation counter overflow is not realistic in a single process");

        let occupied = Slot::Occupied {
            value,
            generation,
            prev,
            next,
        };

        let index = self.next_free_index;

        match self.slots.get_mut(index) {
            Some(slot) => {
                let Slot::Vacant { next_free_index } = std::mem::replace(slot, occupied) else {
                    unreachable!("the freelist only ever points at vacant slots");
                };
                self.next_free_index = next_free_index;
            }
            None => {
                self.slots.push(occupied);
                self.next_free_index = self.slots.len();
            }
        }

        self.len = self
            .len
            .checked_add(1)
            .expect("list length cannot exceed the address space");

        NodeHandle { index, generation }
    }

    fn release_storage(&mut self) {
        self.slots = Vec::new();
        self.next_free_index = 0;
        self.head = None;
        self.tail = None;
    }

    fn handle_at(&self, index: usize) -> NodeHandle {
        match self.slots.get(index) {
            Some(Slot::Occupied { generation, .. }) => NodeHandle {
                index,
                generation: *generation,
            },
            _ => unreachable!("list links only ever point at occupied slots"),
        }
    }

    fn set_prev(&mut self, index: usize, new_prev: Option<usize>) {
        if let Some(Slot::Occupied { prev, .. }) = self.slots.get_mut(index) {
            *prev = new_prev;
        }
    }

    fn set_next(&mut self, index: usize, new_next: Option<usize>) {
        if let Some(Slot::Occupied { next, .. }) = self.slots.get_mut(index) {
            *next = new_next;
        }
    }
}

impl<T> Default for PooledList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the values of a [`PooledList`], from front to back.
#[derive(Debug)]
pub struct Iter<'a, T> {
    list: &'a PooledList<T>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;

        match self.list.slots.get(index) {
            Some(Slot::Occupied { value, next, .. }) => {
                self.cursor = *next;
                self.remaining = self.remaining.saturating_sub(1);
                Some(value)
            }
            _ => None,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<T> FusedIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a PooledList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
