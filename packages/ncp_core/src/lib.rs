#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Buffer pools, packet queues and destination routing for the host side of a network
//! co-processor driver.
//!
//! Frames move between the co-processor, interrupt handlers and consumer tasks without touching
//! a general-purpose heap on the hot path:
//!
//! 1. A producer takes a fixed-size [`Block`] from a [`BlockPool`] (directly or through a
//!    [`BufferManager`]) and fills it.
//! 2. It submits the block to a destination through a [`Router`], together with a
//!    [`StatusHandler`].
//! 3. The router appends the packet to the destination [`Queue`] and raises the destination
//!    [`Signal`].
//! 4. A consumer woken by the signal dispatches the packet to the destination handler as a
//!    [`Delivery`].
//! 5. When the delivery is finished, the block returns to its pool and the status handler is
//!    invoked, exactly once.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use ncp_core::{
//!     BlockPool, Delivery, DestinationId, FlagGroup, NodePool, PacketStatus, Queue, Router,
//!     Signal, StatusHandler,
//! };
//!
//! const SOCKET: DestinationId = DestinationId(7);
//!
//! let blocks = BlockPool::builder().block_size(1536).block_count(4).build()?;
//! let nodes = NodePool::new(16)?;
//! let flags = Arc::new(FlagGroup::new());
//!
//! let router = Router::builder()
//!     .register_destination(
//!         SOCKET,
//!         |delivery: Delivery| {
//!             assert_eq!(delivery.payload(), b"hello");
//!             delivery.complete();
//!         },
//!         Signal::new(flags.clone(), 0b1),
//!         Queue::new(&nodes)?,
//!     )?
//!     .build();
//!
//! let mut frame = blocks.alloc()?;
//! frame[..5].copy_from_slice(b"hello");
//!
//! let (status, completion) = StatusHandler::completion();
//! router.submit(SOCKET, frame, 5, status)?;
//!
//! // Normally a `Consumer` thread does this after waiting on `flags`.
//! router.dispatch_pending(SOCKET)?;
//!
//! assert_eq!(completion.wait(), PacketStatus::Completed);
//! # Ok::<(), ncp_core::Error>(())
//! ```
//!
//! # Interrupt context
//!
//! Pool allocation, pool release, enqueue and submit never block; they only hold an
//! [`AtomicSection`] for a few pointer updates. Code that must not fail on queue exhaustion
//! reserves [`QueueNode`]s ahead of time and submits with [`Router::submit_node()`].
//!
//! # Exhaustion
//!
//! Pools and node arenas have a fixed capacity. Running out is reported as
//! [`Error::ResourceExhausted`] (or [`QueueFull`], which hands the value back) and is never
//! fatal; callers decide whether to drop, retry or apply backpressure.

mod atomic_section;
mod block;
mod block_pool;
mod block_pool_builder;
mod buffer_manager;
mod consumer;
mod error;
mod event_flags;
mod node_pool;
mod packet;
mod queue;
mod router;
mod router_builder;
mod status;
mod ticks;

pub use atomic_section::AtomicSection;
pub use block::*;
pub use block_pool::{BLOCK_ALIGN, BlockPool, PoolStats};
pub use block_pool_builder::*;
pub use buffer_manager::*;
pub use consumer::*;
pub use error::*;
pub use event_flags::*;
pub use node_pool::{NodePool, QueueNode};
pub use packet::*;
pub use queue::*;
pub use router::{DestinationHandler, DestinationId, DestinationStats, Dispatch, Router};
pub use router_builder::*;
pub use status::*;
pub use ticks::*;
