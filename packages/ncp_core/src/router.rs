//! Destination routing: submission, queuing and consumer-side dispatch of packets.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::HashMap;
use tracing::{debug, trace};

use crate::{
    Block, Delivery, Error, Failure, Packet, PacketStatus, Queue, QueueFull, QueueNode, Resource,
    Result, RouterBuilder, Signal, StatusHandler, TickSource,
};

/// Identifies a destination registered with a [`Router`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DestinationId(pub u32);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "destination {}", self.0)
    }
}

/// Processes packets delivered to one destination.
///
/// The handler receives each packet as a [`Delivery`] and must finish it exactly once, either
/// before returning or later from another thread. Handlers of queued destinations run on the
/// consumer that dispatches the queue; handlers of direct destinations run inline in `submit()`.
///
/// Any `Fn(Delivery) + Send + Sync` closure is a handler.
pub trait DestinationHandler: Send + Sync + 'static {
    /// Handles one delivered packet.
    fn handle(&self, delivery: Delivery);
}

impl<F> DestinationHandler for F
where
    F: Fn(Delivery) + Send + Sync + 'static,
{
    fn handle(&self, delivery: Delivery) {
        self(delivery);
    }
}

/// The outcome of [`Router::dispatch_one()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Dispatch {
    /// One packet was handed to the destination handler.
    Delivered,

    /// The destination queue was empty.
    Idle,
}

/// Counters of one destination, as returned by [`Router::stats()`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DestinationStats {
    /// Packets accepted for the destination (queued or delivered directly).
    pub submitted: u64,

    /// Packets refused because the destination queue had no free node.
    pub rejected: u64,

    /// Packets handed to the destination handler.
    pub dispatched: u64,

    /// Deliveries finished with [`PacketStatus::Completed`].
    pub completed: u64,

    /// Deliveries finished with any failure, including abandoned ones.
    pub failed: u64,

    /// Packets currently waiting in the destination queue.
    pub queued: usize,

    /// The longest time a packet waited in the queue, in ticks of the router tick source.
    pub max_queue_delay: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouteCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    max_queue_delay: AtomicU64,
}

impl RouteCounters {
    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatched(&self, queue_delay: u64) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.max_queue_delay.fetch_max(queue_delay, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self, status: PacketStatus) {
        match status {
            PacketStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            PacketStatus::Failed(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn snapshot(&self, queued: usize) -> DestinationStats {
        DestinationStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued,
            max_queue_delay: self.max_queue_delay.load(Ordering::Relaxed),
        }
    }
}

pub(crate) enum RouteMode {
    Queued { queue: Queue<Packet>, signal: Signal },
    Direct,
}

pub(crate) struct Route {
    pub(crate) handler: Box<dyn DestinationHandler>,
    pub(crate) mode: RouteMode,
    pub(crate) counters: Arc<RouteCounters>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct(type_name::<Self>());

        match &self.mode {
            RouteMode::Queued { queue, signal } => {
                debug.field("queue", queue).field("signal", signal);
            }
            RouteMode::Direct => {
                debug.field("direct", &true);
            }
        }

        debug.finish_non_exhaustive()
    }
}

pub(crate) struct RouterInner {
    pub(crate) routes: HashMap<DestinationId, Route>,
    pub(crate) ticks: Box<dyn TickSource>,
}

/// Routes packets from producers to the handlers of registered destinations.
///
/// Each destination is either *queued*, with a FIFO [`Queue`] drained by a consumer that the
/// router wakes through the destination's [`Signal`], or *direct*, with the handler invoked
/// inline by the submitter. Registrations are fixed when the router is built.
///
/// For every accepted packet the submitter's [`StatusHandler`] is invoked exactly once, after
/// the packet block has been returned to its pool. Packets to the same destination are
/// delivered in submission order; there is no ordering across destinations.
///
/// Handles are cheap to clone; all clones refer to the same routing table. Dropping the last
/// handle drops all queued packets, reporting them as abandoned.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use ncp_core::{
///     BlockPool, DestinationId, Dispatch, FlagGroup, NodePool, PacketStatus, Queue, Router,
///     Signal, StatusHandler,
/// };
///
/// const CONSOLE: DestinationId = DestinationId(1);
///
/// let blocks = BlockPool::builder().block_size(64).block_count(4).build()?;
/// let nodes = NodePool::new(8)?;
/// let flags = Arc::new(FlagGroup::new());
///
/// let router = Router::builder()
///     .register_destination(
///         CONSOLE,
///         |delivery: ncp_core::Delivery| {
///             assert_eq!(delivery.payload(), b"ping");
///             delivery.complete();
///         },
///         Signal::new(flags.clone(), 0b1),
///         Queue::new(&nodes)?,
///     )?
///     .build();
///
/// let mut block = blocks.alloc()?;
/// block[..4].copy_from_slice(b"ping");
///
/// let (status, completion) = StatusHandler::completion();
/// router.submit(CONSOLE, block, 4, status)?;
/// assert_eq!(flags.get(), 0b1);
///
/// assert_eq!(router.dispatch_one(CONSOLE)?, Dispatch::Delivered);
/// assert_eq!(completion.wait(), PacketStatus::Completed);
/// assert_eq!(blocks.available(), 4);
/// # Ok::<(), ncp_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Starts building a new [`Router`].
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub(crate) fn from_inner(inner: RouterInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn route(&self, destination: DestinationId) -> Result<&Route> {
        self.inner
            .routes
            .get(&destination)
            .ok_or(Error::UnknownDestination { destination })
    }

    /// Whether `destination` was registered.
    #[must_use]
    pub fn is_registered(&self, destination: DestinationId) -> bool {
        self.inner.routes.contains_key(&destination)
    }

    /// The signal of a queued destination, or `None` for a direct one.
    pub(crate) fn signal(&self, destination: DestinationId) -> Result<Option<&Signal>> {
        Ok(match &self.route(destination)?.mode {
            RouteMode::Queued { signal, .. } => Some(signal),
            RouteMode::Direct => None,
        })
    }

    /// Submits the first `len` bytes of `buffer` to `destination`.
    ///
    /// For a queued destination the packet is appended to its queue and the destination signal
    /// is raised; for a direct destination the handler is invoked before this returns. Never
    /// blocks.
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownDestination`] or [`Error::Oversized`]: the packet is not accepted, the
    ///   block returns to its pool and `status` is dropped without being invoked.
    /// * [`Error::ResourceExhausted`]: the destination queue had no free node. The block returns
    ///   to its pool and `status` is invoked with [`Failure::ResourceExhausted`] before this
    ///   returns.
    pub fn submit(
        &self,
        destination: DestinationId,
        buffer: Block,
        len: usize,
        status: StatusHandler,
    ) -> Result<()> {
        let route = self.route(destination)?;

        let mut packet = Packet::new(buffer, len, status)?;
        packet.accept(self.inner.ticks.now());

        match &route.mode {
            RouteMode::Queued { queue, signal } => match queue.enqueue(packet) {
                Ok(()) => {
                    route.counters.record_submitted();
                    signal.raise();

                    trace!(%destination, len, "packet queued");
                    Ok(())
                }
                Err(QueueFull(packet)) => {
                    route.counters.record_rejected();
                    debug!(%destination, len, "destination queue full, packet rejected");

                    packet.finish(PacketStatus::Failed(Failure::ResourceExhausted));

                    Err(Error::ResourceExhausted {
                        resource: Resource::QueueNodes,
                    })
                }
            },
            RouteMode::Direct => {
                route.counters.record_submitted();
                self.deliver(destination, route, packet);
                Ok(())
            }
        }
    }

    /// Submits a packet that already occupies a reserved queue node, so queuing cannot fail.
    ///
    /// This is the submission path for contexts that must not fail on resource exhaustion, such
    /// as interrupt handlers: reserve nodes from the destination's [`NodePool`][crate::NodePool]
    /// ahead of time and fill them with packets as frames arrive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDestination`] if `destination` was not registered. The node and
    /// packet are dropped; the status handler is not invoked.
    ///
    /// # Panics
    ///
    /// Panics if the node was reserved from a different node pool than the destination queue
    /// uses.
    pub fn submit_node(
        &self,
        destination: DestinationId,
        mut node: QueueNode<Packet>,
    ) -> Result<()> {
        let route = self.route(destination)?;

        node.accept(self.inner.ticks.now());
        route.counters.record_submitted();

        match &route.mode {
            RouteMode::Queued { queue, signal } => {
                trace!(%destination, len = node.len(), "packet node queued");

                queue.enqueue_node(node);
                signal.raise();
            }
            RouteMode::Direct => {
                self.deliver(destination, route, node.into_value());
            }
        }

        Ok(())
    }

    /// Dequeues the oldest packet of `destination` and hands it to the destination handler.
    ///
    /// The handler runs on the calling thread, outside any atomic section. Direct destinations
    /// never have anything queued and always return [`Dispatch::Idle`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDestination`] if `destination` was not registered.
    pub fn dispatch_one(&self, destination: DestinationId) -> Result<Dispatch> {
        let route = self.route(destination)?;

        let RouteMode::Queued { queue, .. } = &route.mode else {
            return Ok(Dispatch::Idle);
        };

        let Some(packet) = queue.dequeue() else {
            return Ok(Dispatch::Idle);
        };

        self.deliver(destination, route, packet);

        Ok(Dispatch::Delivered)
    }

    /// Dispatches packets of `destination` until its queue is empty. Returns how many were
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDestination`] if `destination` was not registered.
    pub fn dispatch_pending(&self, destination: DestinationId) -> Result<usize> {
        let mut dispatched: usize = 0;

        while self.dispatch_one(destination)? == Dispatch::Delivered {
            dispatched = dispatched.wrapping_add(1);
        }

        Ok(dispatched)
    }

    /// A snapshot of the counters of `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDestination`] if `destination` was not registered.
    pub fn stats(&self, destination: DestinationId) -> Result<DestinationStats> {
        let route = self.route(destination)?;

        let queued = match &route.mode {
            RouteMode::Queued { queue, .. } => queue.len(),
            RouteMode::Direct => 0,
        };

        Ok(route.counters.snapshot(queued))
    }

    fn deliver(&self, destination: DestinationId, route: &Route, packet: Packet) {
        let queue_delay = self
            .inner
            .ticks
            .now()
            .saturating_sub(packet.submitted_at());
        route.counters.record_dispatched(queue_delay);

        route.handler.handle(Delivery::new(
            packet,
            Arc::clone(&route.counters),
            destination,
        ));
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut destinations = self.inner.routes.keys().copied().collect::<Vec<_>>();
        destinations.sort_unstable();

        f.debug_struct(type_name::<Self>())
            .field("destinations", &destinations)
            .finish_non_exhaustive()
    }
}
