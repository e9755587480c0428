//! A worker thread that drains one queued destination.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{DestinationId, Dispatch, Error, FlagGroup, Result, Router};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IterationResult {
    Delivered,
    WaitingForWork,
    Shutdown,
}

/// A thread that waits for the signal of a queued destination and dispatches its packets.
///
/// The flags must be the ones the destination signal raises and the bits a non-empty subset of
/// the signal bits, so that every queued packet wakes the consumer. Several consumers may drain
/// the same destination; shutting one down does not disturb the others. Handler panics are caught and logged; the affected packet
/// is reported as abandoned and the consumer keeps running.
///
/// Dropping the consumer (or calling [`shutdown()`][Self::shutdown]) stops the thread after
/// the delivery in progress, if any. Packets still queued stay in the router.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use ncp_core::{
///     BlockPool, Consumer, Delivery, DestinationId, FlagGroup, NodePool, PacketStatus, Queue,
///     Router, Signal, StatusHandler,
/// };
///
/// const UPLINK: DestinationId = DestinationId(4);
///
/// let blocks = BlockPool::builder().block_size(32).block_count(2).build()?;
/// let nodes = NodePool::new(4)?;
/// let flags = Arc::new(FlagGroup::new());
///
/// let router = Router::builder()
///     .register_destination(
///         UPLINK,
///         Delivery::complete,
///         Signal::new(flags.clone(), 0b10),
///         Queue::new(&nodes)?,
///     )?
///     .build();
///
/// let consumer = Consumer::spawn(router.clone(), UPLINK, flags, 0b10)?;
///
/// let (status, completion) = StatusHandler::completion();
/// router.submit(UPLINK, blocks.alloc()?, 0, status)?;
///
/// assert_eq!(completion.wait(), PacketStatus::Completed);
/// drop(consumer);
/// # Ok::<(), ncp_core::Error>(())
/// ```
pub struct Consumer {
    destination: DestinationId,
    flags: Arc<FlagGroup>,
    bits: u32,
    shutdown_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Starts a consumer thread for `destination`, woken by `bits` of `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDestination`] if `destination` is not registered with `router`.
    /// Returns [`Error::Configuration`] if `destination` is a direct destination, if its signal
    /// raises bits on a different flag group, or if `bits` is zero or includes bits the signal
    /// never raises.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to start the thread.
    pub fn spawn(
        router: Router,
        destination: DestinationId,
        flags: Arc<FlagGroup>,
        bits: u32,
    ) -> Result<Self> {
        let Some(signal) = router.signal(destination)? else {
            return Err(Error::configuration(format!(
                "{destination} is a direct destination and has no queue to drain"
            )));
        };

        if !signal.targets(&flags) {
            return Err(Error::configuration(format!(
                "consumer of {destination} waits on a flag group the destination never signals"
            )));
        }

        if bits == 0 {
            return Err(Error::configuration(format!(
                "consumer of {destination} must wait for at least one event bit"
            )));
        }

        let signalled = signal.bits();
        if bits & !signalled != 0 {
            return Err(Error::configuration(format!(
                "consumer of {destination} waits for {bits:#x}, signal raises {signalled:#x}"
            )));
        }

        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new()
            .name(format!("ncp-consumer-{}", destination.0))
            .spawn({
                let flags = Arc::clone(&flags);
                let shutdown_flag = Arc::clone(&shutdown_flag);

                move || {
                    debug!(%destination, "consumer thread started");
                    consumer_loop(&router, destination, &flags, bits, &shutdown_flag);
                    debug!(%destination, "consumer thread exiting");
                }
            })
            .expect("failed to spawn consumer thread: thread spawning failure is not supported");

        Ok(Self {
            destination,
            flags,
            bits,
            shutdown_flag,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The destination this consumer drains.
    #[must_use]
    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    /// Stops the consumer thread and waits for it to exit. Calling this more than once is fine.
    ///
    /// # Panics
    ///
    /// Resumes the panic if the consumer thread itself panicked outside a handler.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        // Release pairs with the Acquire in the consumer loop.
        self.shutdown_flag.store(true, Ordering::Release);

        // Wakes the thread if it is waiting for work without touching the bits, which other
        // consumers of the same destination may be waiting for.
        self.flags.wake_all();

        if let Err(payload) = handle.join() {
            // Handlers run inside a panic trap, so this is a failure of the consumer itself.
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if thread::panicking() {
            // Joining could hang or double-panic; the thread exits on its own once signalled.
            self.shutdown_flag.store(true, Ordering::Release);
            self.flags.wake_all();
            return;
        }

        self.shutdown();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("destination", &self.destination)
            .field("bits", &format_args!("{:#x}", self.bits))
            .field("running", &self.handle.lock().is_some())
            .finish_non_exhaustive()
    }
}

fn consumer_loop(
    router: &Router,
    destination: DestinationId,
    flags: &FlagGroup,
    bits: u32,
    shutdown_flag: &AtomicBool,
) {
    loop {
        match run_one_iteration(router, destination, shutdown_flag) {
            IterationResult::Delivered => {
                trace!(%destination, "packet dispatched");
            }
            IterationResult::WaitingForWork => {
                // Bits set by a submit after the dequeue above are still pending, so this returns
                // immediately in that case. Shutdown wakes the wait without setting bits.
                flags.wait_any_unless(bits, shutdown_flag);
            }
            IterationResult::Shutdown => break,
        }
    }
}

fn run_one_iteration(
    router: &Router,
    destination: DestinationId,
    shutdown_flag: &AtomicBool,
) -> IterationResult {
    if shutdown_flag.load(Ordering::Acquire) {
        return IterationResult::Shutdown;
    }

    match panic::catch_unwind(AssertUnwindSafe(|| router.dispatch_one(destination))) {
        Ok(Ok(Dispatch::Delivered)) => IterationResult::Delivered,
        Ok(Ok(Dispatch::Idle)) => IterationResult::WaitingForWork,
        Ok(Err(error)) => {
            error!(%destination, %error, "consumer cannot dispatch, stopping");
            IterationResult::Shutdown
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic payload>");

            error!(%destination, message, "destination handler panicked");

            // The packet was reported as abandoned while unwinding; keep serving the queue.
            IterationResult::Delivered
        }
    }
}
