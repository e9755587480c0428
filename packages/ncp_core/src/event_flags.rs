//! Bit-mask event signalling between producers and consumer tasks.

use std::any::type_name;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use event_listener::{Event, Listener};

/// A group of event bits that producers set to wake consumers.
///
/// Implementations must be callable from interrupt context: `set()` may not block.
pub trait EventFlags: Send + Sync {
    /// Sets `bits` and returns the bits that were set before the call.
    fn set(&self, bits: u32) -> u32;
}

/// Host implementation of [`EventFlags`]: an atomic bit mask that consumer threads can wait on.
///
/// Waiting consumes the bits it observes, so each `set()` wakes at most one round of waiting
/// unless the bits are set again.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use ncp_core::{EventFlags, FlagGroup};
///
/// let flags = FlagGroup::new();
/// flags.set(0b0101);
///
/// assert_eq!(flags.wait_any(0b0001, None), 0b0001);
/// assert_eq!(flags.get(), 0b0100);
///
/// // Nothing pending under this mask.
/// assert_eq!(flags.wait_any(0b0010, Some(Duration::ZERO)), 0);
/// ```
pub struct FlagGroup {
    bits: AtomicU32,
    changed: Event,
}

impl FlagGroup {
    /// Creates a group with no bits set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            changed: Event::new(),
        }
    }

    /// The currently set bits.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Clears `bits` and returns the bits that were set before the call.
    pub fn clear(&self, bits: u32) -> u32 {
        self.bits.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Blocks until at least one bit of `mask` is set, then clears and returns the set bits of
    /// `mask`.
    ///
    /// Returns 0 if `timeout` elapses first. `None` (or a timeout too large to represent) waits
    /// indefinitely.
    pub fn wait_any(&self, mask: u32, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        self.wait_inner(mask, deadline, || false)
    }

    /// Like [`wait_any()`][Self::wait_any] without a timeout, but also returns 0 once `stop` is
    /// set and [`wake_all()`][Self::wake_all] has been called afterwards.
    ///
    /// Waking through `stop` leaves the bits untouched, so a waiter that shares its bits with
    /// other waiters can be stopped without one of them consuming the wakeup.
    pub(crate) fn wait_any_unless(&self, mask: u32, stop: &AtomicBool) -> u32 {
        self.wait_inner(mask, None, || stop.load(Ordering::Acquire))
    }

    /// Wakes every waiter so it re-evaluates its stop condition. No bits change.
    pub(crate) fn wake_all(&self) {
        self.changed.notify(usize::MAX);
    }

    fn wait_inner(&self, mask: u32, deadline: Option<Instant>, stop: impl Fn() -> bool) -> u32 {
        loop {
            let taken = self.take(mask);
            if taken != 0 {
                return taken;
            }

            let listener = self.changed.listen();

            // Re-check after registering the listener to avoid lost wakeups.
            let taken = self.take(mask);
            if taken != 0 {
                return taken;
            }

            if stop() {
                return 0;
            }

            match deadline {
                None => listener.wait(),
                Some(deadline) => {
                    if listener.wait_deadline(deadline).is_none() {
                        return self.take(mask);
                    }
                }
            }
        }
    }

    fn take(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask
    }
}

impl Default for FlagGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFlags for FlagGroup {
    fn set(&self, bits: u32) -> u32 {
        let previous = self.bits.fetch_or(bits, Ordering::AcqRel);
        self.changed.notify(usize::MAX);
        previous
    }
}

impl fmt::Debug for FlagGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("bits", &format_args!("{:#034b}", self.get()))
            .finish_non_exhaustive()
    }
}

/// The event bits a router raises when it queues a packet for a destination.
#[derive(Clone)]
pub struct Signal {
    flags: Arc<dyn EventFlags>,
    bits: u32,
}

impl Signal {
    /// Raises `bits` on `flags` for every queued packet. `bits` must be non-zero for the signal
    /// to be accepted by a router.
    #[must_use]
    pub fn new(flags: Arc<dyn EventFlags>, bits: u32) -> Self {
        Self { flags, bits }
    }

    /// The bits this signal raises.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub(crate) fn raise(&self) {
        self.flags.set(self.bits);
    }

    /// Whether this signal raises its bits on `flags`.
    pub(crate) fn targets(&self, flags: &FlagGroup) -> bool {
        ptr::addr_eq(Arc::as_ptr(&self.flags), ptr::from_ref(flags))
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("bits", &format_args!("{:#x}", self.bits))
            .finish_non_exhaustive()
    }
}
