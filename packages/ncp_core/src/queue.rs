use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::node_pool::{Links, NIL, NodeArena, NodeSlot};
use crate::{Error, NodePool, QueueFull, QueueNode, Resource, Result};

/// A FIFO queue of values stored in the nodes of a [`NodePool`].
///
/// The queue is a doubly-linked ring through a sentinel node, so linking and unlinking at either
/// end are O(1) and never allocate. Any number of producers and consumers may share a queue
/// through `&self`; link updates happen inside an atomic section, while values are dropped and
/// callbacks are invoked outside of it.
///
/// Dropping the queue drops every value still in it and returns all its nodes (including the
/// sentinel) to the pool.
///
/// # Examples
///
/// ```
/// use ncp_core::{NodePool, Queue};
///
/// let nodes = NodePool::new(8)?;
/// let queue = Queue::new(&nodes)?;
///
/// queue.enqueue("first").unwrap();
/// queue.enqueue("second").unwrap();
///
/// assert_eq!(queue.dequeue(), Some("first"));
/// assert_eq!(queue.dequeue(), Some("second"));
/// assert!(queue.is_empty());
/// # Ok::<(), ncp_core::Error>(())
/// ```
pub struct Queue<T> {
    arena: Arc<NodeArena<T>>,

    /// Index of the sentinel slot.
    head: u32,
}

impl<T> Queue<T> {
    /// Creates an empty queue, claiming one node of `pool` as its sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the pool has no free node for the sentinel.
    pub fn new(pool: &NodePool<T>) -> Result<Self> {
        let arena = Arc::clone(pool.arena());

        let head = arena
            .with_entries(|entries| {
                let index = entries.reserve()?;
                entries.make_sentinel(index);
                Some(index)
            })
            .ok_or(Error::ResourceExhausted {
                resource: Resource::QueueNodes,
            })?;

        Ok(Self { arena, head })
    }

    /// The node pool this queue draws from.
    #[must_use]
    pub fn node_pool(&self) -> NodePool<T> {
        NodePool::from_arena(Arc::clone(&self.arena))
    }

    /// Appends `value` at the tail, taking a node from the pool.
    ///
    /// # Errors
    ///
    /// Returns the value inside [`QueueFull`] if the pool has no free node. The queue is
    /// unchanged.
    pub fn enqueue(&self, value: T) -> std::result::Result<(), QueueFull<T>> {
        self.insert(value, End::Tail)
    }

    /// Inserts `value` at the head, taking a node from the pool. It will be dequeued next.
    ///
    /// # Errors
    ///
    /// Returns the value inside [`QueueFull`] if the pool has no free node.
    pub fn push_front(&self, value: T) -> std::result::Result<(), QueueFull<T>> {
        self.insert(value, End::Head)
    }

    /// Appends a node reserved earlier. Never fails.
    ///
    /// # Panics
    ///
    /// Panics if the node was reserved from a different pool than the one this queue uses.
    pub fn enqueue_node(&self, node: QueueNode<T>) {
        self.insert_node(node, End::Tail);
    }

    /// Inserts a node reserved earlier at the head. Never fails.
    ///
    /// # Panics
    ///
    /// Panics if the node was reserved from a different pool than the one this queue uses.
    pub fn push_front_node(&self, node: QueueNode<T>) {
        self.insert_node(node, End::Head);
    }

    fn insert(&self, value: T, end: End) -> std::result::Result<(), QueueFull<T>> {
        let head = self.head;

        self.arena.with_entries(|entries| {
            let Some(index) = entries.reserve() else {
                return Err(QueueFull(value));
            };

            let (prev, next) = end.neighbors(entries.links(head), head);
            entries.link_between(head, prev, next, index, value);

            Ok(())
        })
    }

    fn insert_node(&self, node: QueueNode<T>, end: End) {
        let (slot, value) = node.into_parts();

        assert!(
            Arc::ptr_eq(slot.arena(), &self.arena),
            "{} was given a node reserved from a different node pool",
            type_name::<Self>()
        );

        let index = slot.disarm();
        let head = self.head;

        self.arena.with_entries(|entries| {
            let (prev, next) = end.neighbors(entries.links(head), head);
            entries.link_between(head, prev, next, index, value);
        });
    }

    /// Removes the value at the head and returns its node to the pool.
    #[must_use]
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head;

        self.arena.with_entries(|entries| {
            let first = entries.links(head).next;

            if first == head {
                return None;
            }

            let value = entries.unlink(head, first);
            entries.release(first);
            Some(value)
        })
    }

    /// Removes the value at the head, keeping its node reserved so it can be enqueued again
    /// without allocating.
    #[must_use]
    pub fn dequeue_node(&self) -> Option<QueueNode<T>> {
        let head = self.head;

        let (index, value) = self.arena.with_entries(|entries| {
            let first = entries.links(head).next;

            if first == head {
                return None;
            }

            Some((first, entries.unlink(head, first)))
        })?;

        Some(QueueNode::from_parts(
            NodeSlot::new(Arc::clone(&self.arena), index),
            value,
        ))
    }

    /// Removes the first value, counting from the head, for which `predicate` returns `true`.
    ///
    /// The predicate runs inside the atomic section and must be short.
    pub fn remove_first(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let head = self.head;

        self.arena.with_entries(|entries| {
            let mut cursor = entries.links(head).next;

            while cursor != head {
                if predicate(entries.value(cursor)) {
                    let value = entries.unlink(head, cursor);
                    entries.release(cursor);
                    return Some(value);
                }

                cursor = entries.links(cursor).next;
            }

            None
        })
    }

    /// Removes every value for which `predicate` returns `true` and passes each one, in queue
    /// order, to `on_removed`. The remaining values keep their order. Returns the number of values
    /// removed.
    ///
    /// The predicate runs inside the atomic section and must be short; `on_removed` runs outside
    /// of it.
    pub fn flush_matching(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
        mut on_removed: impl FnMut(T),
    ) -> usize {
        let head = self.head;

        let mut next = self.arena.with_entries(|entries| {
            let mut chain_head = NIL;
            let mut chain_tail = NIL;
            let mut cursor = entries.links(head).next;

            while cursor != head {
                let following = entries.links(cursor).next;

                if predicate(entries.value(cursor)) {
                    chain_tail = entries.detach(head, cursor, chain_tail);

                    if chain_head == NIL {
                        chain_head = chain_tail;
                    }
                }

                cursor = following;
            }

            chain_head
        });

        let mut removed: usize = 0;

        while next != NIL {
            let (value, following) = self
                .arena
                .with_entries(|entries| entries.take_detached(next));

            on_removed(value);
            removed = removed.wrapping_add(1);
            next = following;
        }

        removed
    }

    /// Removes every value, passing each one in queue order to `on_removed`. Returns the number
    /// of values removed.
    pub fn flush(&self, on_removed: impl FnMut(T)) -> usize {
        self.flush_matching(|_| true, on_removed)
    }

    /// The number of values in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head;
        self.arena.with_entries(|entries| entries.len(head)) as usize
    }

    /// Whether the queue holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.flush(drop);

        let head = self.head;
        self.arena.with_entries(|entries| entries.release(head));
    }
}

impl<T> fmt::Debug for Queue<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("head", &self.head)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
enum End {
    Head,
    Tail,
}

impl End {
    /// The two adjacent slots a new node is linked between.
    fn neighbors(self, sentinel: Links, head: u32) -> (u32, u32) {
        match self {
            Self::Head => (head, sentinel.next),
            Self::Tail => (sentinel.prev, head),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Queue<u32>: Send, Sync, fmt::Debug);

    fn drain<T>(queue: &Queue<T>) -> Vec<T> {
        std::iter::from_fn(|| queue.dequeue()).collect()
    }

    #[test]
    fn fifo_order() {
        let nodes = NodePool::new(8).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        for value in 1..=5 {
            queue.enqueue(value).unwrap();
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(drain(&queue), vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn sentinel_takes_one_node() {
        let nodes = NodePool::<u8>::new(3).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        assert_eq!(nodes.available(), 2);

        drop(queue);
        assert_eq!(nodes.available(), 3);
    }

    #[test]
    fn queue_creation_fails_without_free_node() {
        let nodes = NodePool::<u8>::new(1).unwrap();
        let _first = Queue::new(&nodes).unwrap();

        assert!(matches!(
            Queue::new(&nodes),
            Err(Error::ResourceExhausted {
                resource: Resource::QueueNodes
            })
        ));
    }

    #[test]
    fn enqueue_hands_value_back_when_full() {
        let nodes = NodePool::new(2).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        queue.enqueue(String::from("a")).unwrap();
        let rejected = queue.enqueue(String::from("b")).unwrap_err();

        assert_eq!(rejected.into_inner(), "b");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_node_cannot_fail() {
        let nodes = NodePool::new(3).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        let a = nodes.node(1).unwrap();
        let b = nodes.node(2).unwrap();
        assert_eq!(queue.enqueue(3).unwrap_err().into_inner(), 3);

        queue.enqueue_node(a);
        queue.enqueue_node(b);

        assert_eq!(drain(&queue), vec![1, 2]);
    }

    #[test]
    #[should_panic]
    fn enqueue_node_from_foreign_pool_panics() {
        let nodes = NodePool::new(2).unwrap();
        let other = NodePool::new(2).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        queue.enqueue_node(other.node(1).unwrap());
    }

    #[test]
    fn dequeue_node_keeps_slot_for_reuse() {
        let nodes = NodePool::new(2).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        queue.enqueue(10).unwrap();
        let mut node = queue.dequeue_node().unwrap();
        assert_eq!(*node, 10);
        assert_eq!(nodes.available(), 0);

        *node = 11;
        queue.enqueue_node(node);
        assert_eq!(queue.dequeue(), Some(11));
        assert_eq!(nodes.available(), 1);
    }

    #[test]
    fn push_front_jumps_the_queue() {
        let nodes = NodePool::new(8).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        queue.enqueue(2).unwrap();
        queue.enqueue(3).unwrap();
        queue.push_front(1).unwrap();
        queue.push_front_node(nodes.node(0).unwrap());

        assert_eq!(drain(&queue), vec![0, 1, 2, 3]);
    }

    #[test]
    fn remove_first_takes_earliest_match_only() {
        let nodes = NodePool::new(8).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        for value in [1, 4, 2, 4, 3] {
            queue.enqueue(value).unwrap();
        }

        assert_eq!(queue.remove_first(|value| *value == 4), Some(4));
        assert_eq!(queue.remove_first(|value| *value == 9), None);
        assert_eq!(drain(&queue), vec![1, 2, 4, 3]);
    }

    #[test]
    fn remove_first_on_empty_queue() {
        let nodes = NodePool::<u8>::new(1).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        assert_eq!(queue.remove_first(|_| true), None);
    }

    #[test]
    fn flush_matching_preserves_order_of_both_halves() {
        let nodes = NodePool::new(16).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        for value in 1..=10 {
            queue.enqueue(value).unwrap();
        }

        let mut removed = Vec::new();
        let count = queue.flush_matching(|value| value % 3 == 0, |value| removed.push(value));

        assert_eq!(count, 3);
        assert_eq!(removed, vec![3, 6, 9]);
        assert_eq!(drain(&queue), vec![1, 2, 4, 5, 7, 8, 10]);
        assert_eq!(nodes.available(), 15);
    }

    #[test]
    fn flush_empties_queue_and_frees_nodes() {
        let nodes = NodePool::new(4).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        queue.enqueue('a').unwrap();
        queue.enqueue('b').unwrap();

        let mut removed = String::new();
        assert_eq!(queue.flush(|value| removed.push(value)), 2);

        assert_eq!(removed, "ab");
        assert!(queue.is_empty());
        assert_eq!(nodes.available(), 3);
    }

    #[test]
    fn drop_releases_values_and_nodes() {
        let dropped = Arc::new(AtomicUsize::new(0));

        struct CountsDrops(Arc<AtomicUsize>);

        impl Drop for CountsDrops {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let nodes = NodePool::new(4).unwrap();
        let queue = Queue::new(&nodes).unwrap();

        for _ in 0..3 {
            queue.enqueue(CountsDrops(Arc::clone(&dropped))).unwrap();
        }

        drop(queue);

        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        assert_eq!(nodes.available(), 4);
    }

    #[test]
    fn queues_share_one_pool() {
        let nodes = NodePool::new(4).unwrap();
        let first = Queue::new(&nodes).unwrap();
        let second = Queue::new(&nodes).unwrap();

        first.enqueue(1).unwrap();
        second.enqueue(2).unwrap();

        assert!(first.enqueue(3).is_err());

        let node = first.dequeue_node().unwrap();
        second.enqueue_node(node);

        assert_eq!(drain(&second), vec![2, 1]);
        assert!(first.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let nodes = NodePool::new(PRODUCERS * PER_PRODUCER + 1).unwrap();
        let queue = Arc::new(Queue::new(&nodes).unwrap());
        let barrier = Arc::new(Barrier::new(PRODUCERS));

        let handles = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();

                    for sequence in 0..PER_PRODUCER {
                        queue.enqueue((producer, sequence)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_seen = [None::<usize>; PRODUCERS];
        let mut total = 0;

        while let Some((producer, sequence)) = queue.dequeue() {
            let last = last_seen.get_mut(producer).unwrap();
            assert!(last.is_none_or(|last| last < sequence));
            *last = Some(sequence);
            total += 1;
        }

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
    }
}
