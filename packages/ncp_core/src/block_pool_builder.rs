use std::alloc::{Layout, alloc_zeroed};
use std::borrow::Cow;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::block_pool::{BLOCK_ALIGN, Backing, PoolCore};
use crate::{BlockPool, Error, Resource, Result};

/// Builder for creating an instance of [`BlockPool`].
///
/// The block size is mandatory. The memory comes either from a caller-supplied region (use
/// `.region()`, typically a `static` buffer on a target) or is allocated by the pool itself, in
/// which case `.block_count()` is mandatory.
///
/// # Examples
///
/// A pool that owns its memory:
///
/// ```
/// use ncp_core::BlockPool;
///
/// let pool = BlockPool::builder()
///     .name("tx")
///     .block_size(256)
///     .block_count(16)
///     .build()?;
///
/// assert_eq!(pool.available(), 16);
/// # Ok::<(), ncp_core::Error>(())
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct BlockPoolBuilder {
    block_size: Option<usize>,
    block_count: Option<usize>,
    region: Option<&'static mut [u8]>,
    zero_on_alloc: bool,
    name: Cow<'static, str>,

    _not_sync: PhantomData<Cell<()>>,
}

impl BlockPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            block_size: None,
            block_count: None,
            region: None,
            zero_on_alloc: false,
            name: Cow::Borrowed("unnamed"),
            _not_sync: PhantomData,
        }
    }

    /// Sets the size of every block in bytes. Must be a non-zero multiple of
    /// [`BLOCK_ALIGN`][crate::BLOCK_ALIGN].
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Sets the number of blocks.
    ///
    /// Mandatory when the pool owns its memory. With a caller-supplied region the count defaults
    /// to as many blocks as fit and may be set lower to leave the tail of the region unused.
    pub fn block_count(mut self, block_count: usize) -> Self {
        self.block_count = Some(block_count);
        self
    }

    /// Carves the pool out of a caller-supplied region instead of allocating memory.
    ///
    /// The region must start at an address aligned to [`BLOCK_ALIGN`][crate::BLOCK_ALIGN].
    pub fn region(mut self, region: &'static mut [u8]) -> Self {
        self.region = Some(region);
        self
    }

    /// Whether every block is filled with zeroes when allocated. Off by default.
    pub fn zero_on_alloc(mut self, zero_on_alloc: bool) -> Self {
        self.zero_on_alloc = zero_on_alloc;
        self
    }

    /// Names the pool in log output and panic messages.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the configuration, threads every block into the free list and returns the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the block size is zero or not a multiple of
    /// [`BLOCK_ALIGN`][crate::BLOCK_ALIGN], if the region is smaller than one block or misaligned,
    /// or if the block count is missing, zero or does not fit the region.
    ///
    /// Returns [`Error::ResourceExhausted`] if the pool owns its memory and it cannot be allocated.
    pub fn build(self) -> Result<BlockPool> {
        let block_size = match self.block_size {
            None | Some(0) => return Err(Error::configuration("block size must be non-zero")),
            Some(size) if size % BLOCK_ALIGN != 0 => {
                return Err(Error::configuration(format!(
                    "block size {size} is not a multiple of {BLOCK_ALIGN}"
                )));
            }
            Some(size) => size,
        };

        let name = self.name.into_owned();

        let (base, backing, block_count) = match self.region {
            Some(region) => {
                let region_size = region.len();

                if region_size < block_size {
                    return Err(Error::configuration(format!(
                        "region of {region_size} bytes cannot hold one {block_size}-byte block"
                    )));
                }

                if region.as_ptr().align_offset(BLOCK_ALIGN) != 0 {
                    return Err(Error::configuration(format!(
                        "region base is not aligned to {BLOCK_ALIGN} bytes"
                    )));
                }

                let fitting = region_size
                    .checked_div(block_size)
                    .expect("guarded by non-zero block size check");

                let block_count = match self.block_count {
                    None => fitting,
                    Some(0) => return Err(Error::configuration("block count must be non-zero")),
                    Some(requested) if requested > fitting => {
                        return Err(Error::configuration(format!(
                            "{requested} blocks of {block_size} bytes do not fit a {region_size}-byte region"
                        )));
                    }
                    Some(requested) => requested,
                };

                let block_count = checked_block_count(block_count)?;

                (NonNull::from(region).cast::<u8>(), Backing::Borrowed, block_count)
            }
            None => {
                let block_count = match self.block_count {
                    None | Some(0) => {
                        return Err(Error::configuration(
                            "block count must be non-zero when the pool owns its memory",
                        ));
                    }
                    Some(count) => count,
                };

                let layout = block_size
                    .checked_mul(block_count)
                    .and_then(|size| Layout::from_size_align(size, BLOCK_ALIGN).ok())
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "{block_count} blocks of {block_size} bytes exceed the address space"
                        ))
                    })?;

                let block_count = checked_block_count(block_count)?;

                // SAFETY: The layout has a non-zero size because both factors are non-zero.
                let base = unsafe { alloc_zeroed(layout) };

                let base = NonNull::new(base).ok_or(Error::ResourceExhausted {
                    resource: Resource::BackingMemory,
                })?;

                (base, Backing::Owned(layout), block_count)
            }
        };

        // SAFETY: The region is valid, initialized (zeroed or caller-supplied bytes), aligned and
        // exclusively ours for the lifetime of the core; sizes were validated above.
        let core = unsafe {
            PoolCore::new(
                base,
                backing,
                block_size,
                block_count,
                self.zero_on_alloc,
                name,
            )
        };

        Ok(BlockPool::from_core(core))
    }
}

/// Block indexes are `u32` with `u32::MAX` reserved as the end-of-list marker.
fn checked_block_count(block_count: usize) -> Result<u32> {
    u32::try_from(block_count)
        .ok()
        .filter(|count| *count < u32::MAX)
        .ok_or_else(|| {
            Error::configuration(format!("{block_count} blocks exceed the supported maximum"))
        })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use testing::aligned_region;

    use super::*;

    fn problem_of(result: Result<BlockPool>) -> String {
        match result {
            Err(Error::Configuration { problem }) => problem,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let problem = problem_of(BlockPool::builder().block_size(0).block_count(4).build());

        assert!(problem.contains("non-zero"));
    }

    #[test]
    fn missing_block_size_is_rejected() {
        problem_of(BlockPool::builder().block_count(4).build());
    }

    #[test]
    fn unaligned_block_size_is_rejected() {
        let problem = problem_of(BlockPool::builder().block_size(6).block_count(4).build());

        assert!(problem.contains("multiple of 4"));
    }

    #[test]
    fn region_smaller_than_block_is_rejected() {
        let problem = problem_of(
            BlockPool::builder()
                .region(aligned_region(32))
                .block_size(64)
                .build(),
        );

        assert!(problem.contains("cannot hold one"));
    }

    #[test]
    fn misaligned_region_is_rejected() {
        let misaligned = aligned_region(72).get_mut(1..65).unwrap();

        problem_of(
            BlockPool::builder()
                .region(misaligned)
                .block_size(8)
                .build(),
        );
    }

    #[test]
    fn block_count_beyond_region_is_rejected() {
        let problem = problem_of(
            BlockPool::builder()
                .region(aligned_region(256))
                .block_size(64)
                .block_count(5)
                .build(),
        );

        assert!(problem.contains("do not fit"));
    }

    #[test]
    fn owned_pool_needs_block_count() {
        problem_of(BlockPool::builder().block_size(64).build());
        problem_of(BlockPool::builder().block_size(64).block_count(0).build());
    }

    #[test]
    fn block_count_may_leave_region_tail_unused() {
        let pool = BlockPool::builder()
            .region(aligned_region(256))
            .block_size(64)
            .block_count(2)
            .build()
            .unwrap();

        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn name_is_kept() {
        let pool = BlockPool::builder()
            .name(String::from("dedicated-7"))
            .block_size(8)
            .block_count(1)
            .build()
            .unwrap();

        assert_eq!(pool.name(), "dedicated-7");
    }

    #[test]
    fn owned_region_overflow_is_rejected() {
        let problem = problem_of(
            BlockPool::builder()
                .block_size(usize::MAX - 7)
                .block_count(2)
                .build(),
        );

        assert!(problem.contains("exceed"));
    }
}
