use std::any::type_name;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use critical_section::Mutex;

use crate::atomic_section::atomically;
use crate::{Error, QueueFull, Result};

/// Marks the end of the free list and of a detached chain.
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Links {
    pub(crate) prev: u32,
    pub(crate) next: u32,
}

#[derive(Debug)]
pub(crate) enum Slot<T> {
    Vacant {
        next_free: u32,
    },

    /// Owned by a `QueueNode` (or a queue operation in progress); the value lives outside.
    Reserved,

    /// The head of one queue. `links` point at the last and first nodes, or back at the sentinel
    /// itself when the queue is empty.
    Sentinel {
        links: Links,
        len: u32,
    },

    Linked {
        links: Links,
        value: T,
    },

    /// Unlinked by a flush but not yet handed to the caller. Chained through `next`.
    Detached {
        next: u32,
        value: T,
    },
}

/// The slots of one arena plus its free list. Only ever touched inside an atomic section.
#[derive(Debug)]
pub(crate) struct Entries<T> {
    slots: Box<[Slot<T>]>,

    /// Index of the most recently freed slot. Like the block pool, the free list is intrusive:
    /// each vacant slot stores the index of the next one.
    free_head: u32,

    available: u32,
}

impl<T> Entries<T> {
    fn slot(&self, index: u32) -> &Slot<T> {
        self.slots
            .get(index as usize)
            .expect("slot indexes never leave the arena they were issued by")
    }

    fn slot_mut(&mut self, index: u32) -> &mut Slot<T> {
        self.slots
            .get_mut(index as usize)
            .expect("slot indexes never leave the arena they were issued by")
    }

    pub(crate) fn available(&self) -> u32 {
        self.available
    }

    /// Takes a slot off the free list and marks it reserved.
    pub(crate) fn reserve(&mut self) -> Option<u32> {
        if self.free_head == NIL {
            return None;
        }

        let index = self.free_head;

        let Slot::Vacant { next_free } = mem::replace(self.slot_mut(index), Slot::Reserved) else {
            panic!("free list of {} points at occupied slot {index}", type_name::<Self>());
        };

        self.free_head = next_free;
        self.available = self
            .available
            .checked_sub(1)
            .expect("a non-empty free list has a non-zero count");

        Some(index)
    }

    /// Puts a reserved slot (or an empty sentinel) back on the free list.
    pub(crate) fn release(&mut self, index: u32) {
        let next_free = self.free_head;
        let previous = mem::replace(self.slot_mut(index), Slot::Vacant { next_free });

        assert!(
            matches!(previous, Slot::Reserved | Slot::Sentinel { len: 0, .. }),
            "released slot {index} of {} while it was {}",
            type_name::<Self>(),
            slot_state(&previous)
        );

        self.free_head = index;
        self.available = self
            .available
            .checked_add(1)
            .expect("cannot release more slots than the arena contains");
    }

    pub(crate) fn make_sentinel(&mut self, index: u32) {
        let slot = self.slot_mut(index);
        assert!(matches!(slot, Slot::Reserved), "sentinel slot must be reserved");

        *slot = Slot::Sentinel {
            links: Links {
                prev: index,
                next: index,
            },
            len: 0,
        };
    }

    fn links_mut(&mut self, index: u32) -> &mut Links {
        match self.slot_mut(index) {
            Slot::Sentinel { links, .. } | Slot::Linked { links, .. } => links,
            other => panic!("slot {index} is not part of a queue but {}", slot_state(other)),
        }
    }

    pub(crate) fn links(&self, index: u32) -> Links {
        match self.slot(index) {
            Slot::Sentinel { links, .. } | Slot::Linked { links, .. } => *links,
            other => panic!("slot {index} is not part of a queue but {}", slot_state(other)),
        }
    }

    pub(crate) fn len(&self, head: u32) -> u32 {
        match self.slot(head) {
            Slot::Sentinel { len, .. } => *len,
            other => panic!("slot {head} is not a queue head but {}", slot_state(other)),
        }
    }

    fn len_mut(&mut self, head: u32) -> &mut u32 {
        match self.slot_mut(head) {
            Slot::Sentinel { len, .. } => len,
            other => panic!("slot {head} is not a queue head but {}", slot_state(other)),
        }
    }

    pub(crate) fn value(&self, index: u32) -> &T {
        match self.slot(index) {
            Slot::Linked { value, .. } => value,
            other => panic!("slot {index} holds no linked value but {}", slot_state(other)),
        }
    }

    /// Links the reserved slot `index` between `prev` and `next`, which must be adjacent members
    /// of the queue headed by `head`.
    pub(crate) fn link_between(&mut self, head: u32, prev: u32, next: u32, index: u32, value: T) {
        let slot = self.slot_mut(index);
        assert!(
            matches!(slot, Slot::Reserved),
            "only reserved slots can be linked, slot {index} is {}",
            slot_state(slot)
        );

        *slot = Slot::Linked {
            links: Links { prev, next },
            value,
        };

        self.links_mut(prev).next = index;
        self.links_mut(next).prev = index;

        let len = self.len_mut(head);
        *len = len.checked_add(1).expect("queue length is bounded by the arena");
    }

    /// Unlinks `index` from the queue headed by `head`, leaving the slot reserved.
    pub(crate) fn unlink(&mut self, head: u32, index: u32) -> T {
        let Slot::Linked { links, value } = mem::replace(self.slot_mut(index), Slot::Reserved)
        else {
            panic!("slot {index} is not linked into a queue");
        };

        self.links_mut(links.prev).next = links.next;
        self.links_mut(links.next).prev = links.prev;

        let len = self.len_mut(head);
        *len = len
            .checked_sub(1)
            .expect("an unlinked node was counted in its queue");

        value
    }

    /// Unlinks `index` and appends it to a detached chain ending at `tail`. Returns the new tail.
    pub(crate) fn detach(&mut self, head: u32, index: u32, tail: u32) -> u32 {
        let value = self.unlink(head, index);
        *self.slot_mut(index) = Slot::Detached { next: NIL, value };

        if tail != NIL {
            match self.slot_mut(tail) {
                Slot::Detached { next, .. } => *next = index,
                other => panic!("detached chain ends in {}", slot_state(other)),
            }
        }

        index
    }

    /// Takes the value out of a detached slot and frees the slot. Returns the value and the next
    /// slot of the chain.
    pub(crate) fn take_detached(&mut self, index: u32) -> (T, u32) {
        let Slot::Detached { next, value } = mem::replace(self.slot_mut(index), Slot::Reserved)
        else {
            panic!("slot {index} is not detached");
        };

        self.release(index);

        (value, next)
    }
}

fn slot_state<T>(slot: &Slot<T>) -> &'static str {
    match slot {
        Slot::Vacant { .. } => "vacant",
        Slot::Reserved => "reserved",
        Slot::Sentinel { .. } => "a queue head",
        Slot::Linked { .. } => "linked",
        Slot::Detached { .. } => "detached",
    }
}

/// The shared arena behind a [`NodePool`] and every queue and node created from it.
#[derive(Debug)]
pub(crate) struct NodeArena<T> {
    entries: Mutex<RefCell<Entries<T>>>,
    capacity: u32,
}

impl<T> NodeArena<T> {
    /// Runs `f` with exclusive access to the entries, inside an atomic section.
    pub(crate) fn with_entries<R>(&self, f: impl FnOnce(&mut Entries<T>) -> R) -> R {
        atomically(|cs| f(&mut self.entries.borrow_ref_mut(cs)))
    }
}

/// A fixed-capacity arena of queue nodes shared by any number of [`Queue`][crate::Queue]s.
///
/// Every queue claims one node as its head and every queued value occupies one node. Nodes are
/// never allocated after creation, so enqueuing can fail with [`QueueFull`] but never blocks or
/// touches the heap.
///
/// Callers that must not fail at enqueue time (such as interrupt handlers) reserve a
/// [`QueueNode`] up front with [`node()`][Self::node] and link it later with
/// [`Queue::enqueue_node()`][crate::Queue::enqueue_node].
///
/// Handles are cheap to clone; all clones refer to the same arena.
pub struct NodePool<T> {
    arena: Arc<NodeArena<T>>,
}

impl<T> NodePool<T> {
    /// Creates an arena of `capacity` nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `capacity` is zero or too large to index.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = u32::try_from(capacity)
            .ok()
            .filter(|capacity| *capacity > 0 && *capacity < NIL)
            .ok_or_else(|| {
                Error::configuration(format!("node pool capacity {capacity} is out of range"))
            })?;

        let slots = (0..capacity)
            .map(|index| Slot::Vacant {
                next_free: index
                    .checked_add(1)
                    .filter(|next| *next < capacity)
                    .unwrap_or(NIL),
            })
            .collect::<Box<[_]>>();

        Ok(Self {
            arena: Arc::new(NodeArena {
                entries: Mutex::new(RefCell::new(Entries {
                    slots,
                    free_head: 0,
                    available: capacity,
                })),
                capacity,
            }),
        })
    }

    /// Reserves a node holding `value`, to be linked into a queue later.
    ///
    /// # Errors
    ///
    /// Returns the value inside [`QueueFull`] if every node of the arena is in use.
    pub fn node(&self, value: T) -> std::result::Result<QueueNode<T>, QueueFull<T>> {
        match self.arena.with_entries(Entries::reserve) {
            Some(index) => Ok(QueueNode {
                slot: NodeSlot::new(Arc::clone(&self.arena), index),
                value,
            }),
            None => Err(QueueFull(value)),
        }
    }

    /// The total number of nodes in the arena, including queue heads.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity as usize
    }

    /// The number of nodes that are neither reserved, linked nor used as a queue head.
    #[must_use]
    pub fn available(&self) -> usize {
        self.arena.with_entries(|entries| entries.available()) as usize
    }

    pub(crate) fn arena(&self) -> &Arc<NodeArena<T>> {
        &self.arena
    }

    pub(crate) fn from_arena(arena: Arc<NodeArena<T>>) -> Self {
        Self { arena }
    }
}

impl<T> Clone for NodePool<T> {
    fn clone(&self) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
        }
    }
}

impl<T> fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.arena.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Ownership of one reserved slot. Frees the slot when dropped unless disarmed.
pub(crate) struct NodeSlot<T> {
    arena: Arc<NodeArena<T>>,
    index: u32,
    armed: bool,
}

impl<T> NodeSlot<T> {
    pub(crate) fn new(arena: Arc<NodeArena<T>>, index: u32) -> Self {
        Self {
            arena,
            index,
            armed: true,
        }
    }

    pub(crate) fn arena(&self) -> &Arc<NodeArena<T>> {
        &self.arena
    }

    /// Hands responsibility for the slot to the caller.
    pub(crate) fn disarm(mut self) -> u32 {
        self.armed = false;
        self.index
    }
}

impl<T> Drop for NodeSlot<T> {
    fn drop(&mut self) {
        if self.armed {
            let index = self.index;
            self.arena.with_entries(|entries| entries.release(index));
        }
    }
}

impl<T> fmt::Debug for NodeSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("index", &self.index)
            .field("armed", &self.armed)
            .finish()
    }
}

/// A value together with a reserved node of a [`NodePool`], ready to be linked into a queue
/// without allocating.
///
/// Dropping the node drops the value and returns the slot to the arena.
pub struct QueueNode<T> {
    slot: NodeSlot<T>,
    value: T,
}

impl<T> QueueNode<T> {
    pub(crate) fn from_parts(slot: NodeSlot<T>, value: T) -> Self {
        Self { slot, value }
    }

    pub(crate) fn into_parts(self) -> (NodeSlot<T>, T) {
        (self.slot, self.value)
    }

    /// Releases the node and returns the value.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Stores a new value in the node and returns the previous one, keeping the node reserved.
    pub fn replace(&mut self, value: T) -> T {
        mem::replace(&mut self.value, value)
    }

    /// Whether the node was reserved from `pool` (or any clone of it).
    #[must_use]
    pub fn belongs_to(&self, pool: &NodePool<T>) -> bool {
        Arc::ptr_eq(self.slot.arena(), pool.arena())
    }
}

impl<T> Deref for QueueNode<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for QueueNode<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for QueueNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("index", &self.slot.index)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(NodePool<u32>: Send, Sync, Clone, fmt::Debug);
    assert_impl_all!(QueueNode<u32>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(NodePool<std::rc::Rc<u32>>: Send, Sync);

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            NodePool::<u8>::new(0),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn nodes_are_reserved_until_dropped() {
        let pool = NodePool::new(2).unwrap();

        let a = pool.node(1).unwrap();
        let b = pool.node(2).unwrap();
        assert_eq!(pool.available(), 0);

        let rejected = pool.node(3).unwrap_err();
        assert_eq!(rejected.into_inner(), 3);

        drop(a);
        assert_eq!(pool.available(), 1);

        assert_eq!(b.into_value(), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn replace_keeps_node_reserved() {
        let pool = NodePool::new(1).unwrap();

        let mut node = pool.node("a").unwrap();
        assert_eq!(node.replace("b"), "a");
        assert_eq!(*node, "b");
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn belongs_to_recognizes_clones() {
        let pool = NodePool::new(1).unwrap();
        let other = NodePool::new(1).unwrap();

        let node = pool.node(()).unwrap();

        assert!(node.belongs_to(&pool.clone()));
        assert!(!node.belongs_to(&other));
    }

    #[test]
    fn freed_slots_are_reused_most_recent_first() {
        let pool = NodePool::new(3).unwrap();

        let _a = pool.node(0).unwrap();
        let b = pool.node(0).unwrap();
        let b_index = b.slot.index;
        drop(b);

        let c = pool.node(0).unwrap();
        assert_eq!(c.slot.index, b_index);
    }
}
