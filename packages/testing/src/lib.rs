#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, examples and benchmarks of the ncp packages.

use std::slice;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

mod recorder;

pub use recorder::*;

/// Alignment of the regions returned by [`aligned_region()`], matching the strictest block
/// alignment the pools require.
pub const REGION_ALIGN: usize = 8;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// The test runs on a separate thread. If it takes longer than the timeout, the calling test
/// panics so that CI does not hang on a lost wakeup or a deadlocked consumer.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly, so that mutation testing can detect hanging mutants.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode) and resumes the
/// panic of the test itself if it panicked.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
#[cfg_attr(test, mutants::skip)] // Mutating the timeout only changes how long hangs take.
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has timed out already.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Returns a zeroed, `'static` byte region of `size` bytes whose start is aligned to
/// [`REGION_ALIGN`], standing in for the statically allocated buffers pools are carved from on
/// a target.
///
/// The memory is leaked; only use this in tests and examples.
#[must_use]
pub fn aligned_region(size: usize) -> &'static mut [u8] {
    let words = Box::leak(vec![0_u64; size.div_ceil(REGION_ALIGN)].into_boxed_slice());

    let byte_len = words
        .len()
        .checked_mul(REGION_ALIGN)
        .expect("a region that was just allocated cannot overflow usize");

    // SAFETY: The words are leaked, so the memory lives forever and is only reachable through
    // the returned slice. Every bit pattern is a valid `u8` and `u8` has no alignment needs.
    let bytes = unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), byte_len) };

    bytes
        .get_mut(..size)
        .expect("the region was rounded up from the requested size")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_allows_fast_tests() {
        let result = with_watchdog(|| 42);
        assert_eq!(result, 42);
    }

    #[test]
    #[should_panic]
    fn watchdog_propagates_test_panic() {
        with_watchdog(|| panic!("intentional panic"));
    }

    #[test]
    fn aligned_region_has_requested_size_and_alignment() {
        for size in [1, 8, 13, 256] {
            let region = aligned_region(size);

            assert_eq!(region.len(), size);
            assert_eq!(region.as_ptr().align_offset(REGION_ALIGN), 0);
            assert!(region.iter().all(|byte| *byte == 0));
        }
    }
}
