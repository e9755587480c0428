//! Short critical sections shared by interrupt handlers and tasks.

use std::fmt;
use std::marker::PhantomData;

use critical_section::{CriticalSection, RestoreState};

/// A token proving that preemption is masked for the current execution context.
///
/// Entering captures the prior interrupt state; exiting (or dropping the token) restores exactly
/// that state. Pools and queues only hold a section for the duration of a few pointer updates,
/// never while calling back into user code.
///
/// With the default `host-critical-section` feature the underlying primitive is the `std`
/// implementation of the `critical-section` crate, which serializes all sections in the process.
/// Firmware builds disable default features and link their own `critical-section`
/// implementation (typically masking interrupts up to a priority level).
///
/// The token is bound to the context that entered it and cannot be sent to another thread.
///
/// # Examples
///
/// ```
/// use ncp_core::AtomicSection;
///
/// let section = AtomicSection::enter();
/// // Shared state may be touched here.
/// section.exit();
/// ```
#[must_use = "the section is exited as soon as the token is dropped"]
pub struct AtomicSection {
    restore: RestoreState,

    _not_send: PhantomData<*const ()>,
}

impl AtomicSection {
    /// Masks preemption and returns a token that restores the prior state on exit.
    pub fn enter() -> Self {
        // SAFETY: The matching release happens exactly once, in `Drop`, with the state returned
        // here. The token is `!Send` so the release happens in the context that acquired.
        let restore = unsafe { critical_section::acquire() };

        Self {
            restore,
            _not_send: PhantomData,
        }
    }

    /// Restores the interrupt state captured by [`enter()`][Self::enter].
    pub fn exit(self) {
        drop(self);
    }

    /// A `critical-section` token valid for as long as this section is held, for use with
    /// [`critical_section::Mutex`].
    pub(crate) fn token(&self) -> CriticalSection<'_> {
        // SAFETY: The section is held for at least as long as the borrow of `self`.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for AtomicSection {
    fn drop(&mut self) {
        // SAFETY: Paired with the acquire in `enter()`; drop runs exactly once.
        unsafe {
            critical_section::release(self.restore);
        }
    }
}

impl fmt::Debug for AtomicSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicSection").finish_non_exhaustive()
    }
}

/// Runs `f` inside an atomic section.
///
/// Keep `f` short: no blocking, no user callbacks, no dropping of values with side effects.
pub(crate) fn atomically<R>(f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
    let section = AtomicSection::enter();
    let result = f(section.token());
    section.exit();
    result
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;

    use critical_section::Mutex;
    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(AtomicSection: Send, Sync);

    #[test]
    fn enter_exit_round_trip() {
        let section = AtomicSection::enter();
        section.exit();

        // A second section can be entered after the first one was exited.
        let section = AtomicSection::enter();
        drop(section);
    }

    #[test]
    fn atomically_returns_closure_result() {
        let value = atomically(|_| 42);

        assert_eq!(value, 42);
    }

    #[test]
    fn guards_shared_state_across_threads() {
        let counter = Arc::new(Mutex::new(Cell::new(0_u32)));

        let handles = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        atomically(|cs| {
                            let cell = counter.borrow(cs);
                            cell.set(cell.get().wrapping_add(1));
                        });
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(atomically(|cs| counter.borrow(cs).get()), 4000);
    }
}
