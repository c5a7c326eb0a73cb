use std::num::NonZero;

use tokio::time::Instant;

use crate::{Error, IdleHeap, NodeHandle, PooledList, Result};

/// The order in which a [`Pool`] hands out its values.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PoolType {
    /// First in, first out. The value that has been in the pool longest is detached first.
    #[default]
    Queue,

    /// Last in, first out. The value most recently inserted is detached first.
    Stack,
}

/// Capability of a pooled value that tracks its own idleness and can be stopped.
///
/// Values with this capability take part in idle-based eviction via [`Pool::collect_before()`].
pub trait Idle {
    /// The instant at which the value last finished doing work.
    fn active_at(&self) -> Instant;

    /// Stops the value after it has been evicted for idleness.
    fn stop(&self);
}

/// A value that can be stored in a [`Pool`].
///
/// The defaults describe a plain payload: it is stored in the pool's ordering only, is never
/// evicted for idleness and does not care which node holds it.
pub trait PoolItem {
    /// The idle-tracking capability of this value, if it has one.
    ///
    /// This is consulted once, when the value enters the pool.
    fn idle(&self) -> Option<&dyn Idle> {
        None
    }

    /// Informs the value of the node that holds it, or that it has left the pool.
    fn attach(&self, node: Option<NodeHandle>) {
        _ = node;
    }
}

/// Something that can report which pool node holds a value.
pub trait Locate {
    /// The node that holds the value, if it is currently pooled.
    fn node(&self) -> Option<NodeHandle>;
}

impl Locate for NodeHandle {
    fn node(&self) -> Option<NodeHandle> {
        Some(*self)
    }
}

/// A capacity-bounded collection of values with a fixed retrieval order.
///
/// The retrieval order is set by the [`PoolType`]. Values that expose the [`Idle`] capability are
/// additionally tracked in an idle-time min-heap, which lets [`collect_before()`][1] evict the
/// longest-idle values without scanning the whole pool.
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
///
/// use worker_pool::{Pool, PoolItem, PoolType};
///
/// #[derive(Debug, PartialEq)]
/// struct Connection(u32);
///
/// impl PoolItem for Connection {}
///
/// let mut pool = Pool::new(PoolType::Stack, NonZero::new(2));
///
/// pool.insert(Connection(1)).unwrap();
/// pool.insert(Connection(2)).unwrap();
/// assert!(pool.insert(Connection(3)).is_err());
///
/// assert_eq!(pool.detach(), Some(Connection(2)));
/// assert_eq!(pool.detach(), Some(Connection(1)));
/// assert_eq!(pool.detach(), None);
/// ```
///
/// [1]: Self::collect_before
#[derive(Debug)]
pub struct Pool<T> {
    pool_type: PoolType,

    /// `None` means unbounded.
    capacity: Option<NonZero<usize>>,

    list: PooledList<T>,

    /// Only contains the nodes of values that had the `Idle` capability when inserted.
    heap: IdleHeap<NodeHandle>,
}

impl<T> Pool<T>
where
    T: PoolItem,
{
    /// Creates an empty pool. A capacity of `None` makes the pool unbounded.
    #[must_use]
    pub fn new(pool_type: PoolType, capacity: Option<NonZero<usize>>) -> Self {
        Self {
            pool_type,
            capacity,
            list: PooledList::new(),
            heap: IdleHeap::new(),
        }
    }

    /// The retrieval order of the pool.
    #[must_use]
    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    /// The maximum number of values the pool holds, or `None` if unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity.map(NonZero::get)
    }

    /// The number of values in the pool.
    #[must_use]
    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Whether the pool holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Adds a value to the pool at the position dictated by the pool type.
    ///
    /// Inserting a value that is already in the pool is a logic error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the pool is full. The pool is left unchanged.
    pub fn insert(&mut self, value: T) -> Result<NodeHandle> {
        if let Some(capacity) = self.capacity.map(NonZero::get) {
            if self.list.len() >= capacity {
                return Err(Error::Capacity { capacity });
            }
        }

        let handle = match self.pool_type {
            PoolType::Queue => self.list.push_back(value),
            PoolType::Stack => self.list.push_front(value),
        };

        if let Some(value) = self.list.get(handle) {
            value.attach(Some(handle));

            if let Some(idle) = value.idle() {
                self.heap.insert(handle, idle.active_at());
            }
        }

        Ok(handle)
    }

    /// Removes and returns the next value in retrieval order, if any.
    pub fn detach(&mut self) -> Option<T> {
        let front = self.list.front()?;
        self.take(front).ok()
    }

    /// Returns a previously detached value to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the pool is full.
    pub fn release(&mut self, value: T) -> Result<NodeHandle> {
        self.insert(value)
    }

    /// The value that [`detach()`][Self::detach] would return next, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.list.front().and_then(|front| self.list.get(front))
    }

    /// Removes a specific value out of retrieval order.
    ///
    /// The value is identified either directly by its node handle or by anything that can report
    /// the node holding it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotResident`] if the target is not in this pool.
    pub fn del(&mut self, target: &impl Locate) -> Result<T> {
        let node = target.node().ok_or(Error::NotResident)?;
        self.take(node)
    }

    /// Iterates over the values currently in the pool.
    ///
    /// Only membership is meaningful, the iteration order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.list.iter()
    }

    /// Removes all values from the pool, in retrieval order.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.detach()).collect()
    }

    /// Evicts every idle-tracked value that last became active strictly before `cutoff`.
    ///
    /// Values are evicted longest-idle first and are stopped before being dropped. Values without
    /// the [`Idle`] capability are never evicted. Returns the number of evicted values.
    pub fn collect_before(&mut self, cutoff: Instant) -> usize {
        let mut evicted: usize = 0;

        while let Some((node, active_at)) = self.heap.top() {
            // Everything left in the heap became active at or after this one.
            if active_at >= cutoff {
                break;
            }

            self.heap.extract();

            let Ok(value) = self.list.remove(node) else {
                continue;
            };

            value.attach(None);

            if let Some(idle) = value.idle() {
                idle.stop();
            }

            evicted = evicted.saturating_add(1);
        }

        evicted
    }

    fn take(&mut self, node: NodeHandle) -> Result<T> {
        let value = self.list.remove(node)?;
        self.heap.remove(node);

        if self.list.is_empty() {
            self.heap.clear();
        }

        value.attach(None);
        Ok(value)
    }
}
