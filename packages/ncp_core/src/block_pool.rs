use std::alloc::{Layout, dealloc};
use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use critical_section::Mutex;
use tracing::{debug, trace};

use crate::atomic_section::atomically;
use crate::{Block, BlockPoolBuilder, Error, Resource, Result};

/// Alignment of every block handed out by a [`BlockPool`], in bytes.
///
/// Free blocks hold the free-list link, a `u32` index, in their first bytes, so this is the
/// alignment of `u32`. Block sizes must be a multiple of this and caller-supplied regions must
/// start at an address aligned to it.
pub const BLOCK_ALIGN: usize = align_of::<u32>();

/// Marks the end of the free list.
const NIL: u32 = u32::MAX;

/// A fixed-block allocator carved out of one contiguous memory region.
///
/// The region is split into `block_count` blocks of `block_size` bytes at creation time and is
/// never resized. Free blocks form an intrusive free list: the first word of each free block
/// holds the index of the next free block, so the pool needs no memory besides the region.
///
/// Allocating and freeing are O(1), never block and never fragment, which makes them usable from
/// interrupt handlers. Each operation holds an [`AtomicSection`][crate::AtomicSection] only while
/// it updates the free list.
///
/// Handles are cheap to clone; all clones refer to the same pool. Outstanding [`Block`]s keep the
/// region alive, so dropping the last pool handle while blocks are in flight is fine.
///
/// # Examples
///
/// ```
/// use ncp_core::BlockPool;
///
/// let pool = BlockPool::builder().block_size(64).block_count(4).build()?;
///
/// let mut block = pool.alloc()?;
/// block[..5].copy_from_slice(b"hello");
/// assert_eq!(pool.available(), 3);
///
/// pool.free(block);
/// assert_eq!(pool.available(), 4);
/// # Ok::<(), ncp_core::Error>(())
/// ```
#[derive(Clone)]
pub struct BlockPool {
    core: Arc<PoolCore>,
}

impl BlockPool {
    /// Starts building a new [`BlockPool`].
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    pub(crate) fn from_core(core: PoolCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    /// Takes one block from the free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if every block is currently allocated. The pool never
    /// grows and never waits for a block to be freed.
    pub fn alloc(&self) -> Result<Block> {
        let Some(index) = self.core.pop_free() else {
            debug!(pool = %self.core.name, "block pool exhausted");

            return Err(Error::ResourceExhausted {
                resource: Resource::Blocks,
            });
        };

        trace!(pool = %self.core.name, index, "block allocated");

        let mut block = Block::new(Arc::clone(&self.core), index);

        if self.core.zero_on_alloc {
            block.fill(0);
        }

        Ok(block)
    }

    /// Returns a block to the free list. Equivalent to dropping the block.
    ///
    /// # Panics
    ///
    /// Panics if the block was allocated from a different pool.
    pub fn free(&self, block: Block) {
        assert!(
            block.belongs_to(self),
            "block {} was freed into pool '{}' but belongs to pool '{}'",
            block.index(),
            self.core.name,
            block.pool_name()
        );

        drop(block);
    }

    /// The number of blocks that can currently be allocated.
    #[must_use]
    pub fn available(&self) -> usize {
        atomically(|cs| self.core.free_list.borrow(cs).get().available) as usize
    }

    /// The size of every block, in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.core.block_size
    }

    /// The total number of blocks in the pool.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.core.block_count as usize
    }

    /// The name given to the pool at creation, used in log output.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// A snapshot of the allocation statistics of the pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let free_list = atomically(|cs| self.core.free_list.borrow(cs).get());

        PoolStats {
            block_size: self.core.block_size,
            block_count: self.core.block_count as usize,
            available: free_list.available as usize,
            peak_in_use: self.core.block_count.saturating_sub(free_list.low_water) as usize,
            exhausted: free_list.exhausted,
        }
    }

    pub(crate) fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        self.core.integrity_check();
    }
}

impl fmt::Debug for BlockPool {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name", &self.core.name)
            .field("block_size", &self.core.block_size)
            .field("block_count", &self.core.block_count)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// Allocation statistics of a [`BlockPool`], as returned by [`BlockPool::stats()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// The size of every block, in bytes.
    pub block_size: usize,

    /// The total number of blocks.
    pub block_count: usize,

    /// Blocks currently on the free list.
    pub available: usize,

    /// The highest number of blocks that were allocated at the same time.
    pub peak_in_use: usize,

    /// How many allocations failed because the pool was exhausted.
    pub exhausted: u64,
}

/// Where the memory of a pool comes from.
#[derive(Debug)]
pub(crate) enum Backing {
    /// Allocated by the pool with this layout; deallocated when the pool core is dropped.
    Owned(Layout),

    /// Supplied by the caller for the lifetime of the program.
    Borrowed,
}

#[derive(Clone, Copy, Debug)]
struct FreeList {
    head: u32,
    available: u32,

    /// Lowest `available` ever observed, for peak usage statistics.
    low_water: u32,

    exhausted: u64,
}

/// The shared state behind all handles of one pool and all blocks allocated from it.
pub(crate) struct PoolCore {
    base: NonNull<u8>,
    backing: Backing,
    block_size: usize,
    block_count: u32,
    zero_on_alloc: bool,
    name: String,

    free_list: Mutex<Cell<FreeList>>,
}

impl PoolCore {
    /// Threads all blocks of the region into the free list.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `block_count * block_size` initialized bytes
    /// for as long as the returned value lives (deallocated by `Drop` if `backing` is `Owned`),
    /// aligned to `BLOCK_ALIGN`, and not accessed through any other path. `block_size` must be a
    /// non-zero multiple of `BLOCK_ALIGN` and `block_count` must be below `u32::MAX`.
    pub(crate) unsafe fn new(
        base: NonNull<u8>,
        backing: Backing,
        block_size: usize,
        block_count: u32,
        zero_on_alloc: bool,
        name: String,
    ) -> Self {
        let core = Self {
            base,
            backing,
            block_size,
            block_count,
            zero_on_alloc,
            name,
            free_list: Mutex::new(Cell::new(FreeList {
                head: if block_count == 0 { NIL } else { 0 },
                available: block_count,
                low_water: block_count,
                exhausted: 0,
            })),
        };

        atomically(|_| {
            for index in 0..block_count {
                let next = index
                    .checked_add(1)
                    .filter(|next| *next < block_count)
                    .unwrap_or(NIL);

                // SAFETY: Every block is free during construction, so its link word is ours.
                unsafe {
                    core.write_link(index, next);
                }
            }
        });

        debug!(
            pool = %core.name,
            block_size,
            block_count,
            "block pool created"
        );

        core
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn block_ptr(&self, index: u32) -> NonNull<u8> {
        assert!(
            index < self.block_count,
            "block {index} out of bounds in pool '{}' of {} blocks",
            self.name,
            self.block_count
        );

        let offset = (index as usize)
            .checked_mul(self.block_size)
            .expect("guarded by the region size check at creation");

        // SAFETY: Guarded by the bounds check above, the offset lies inside the region.
        unsafe { self.base.add(offset) }
    }

    /// # Safety
    ///
    /// The block must be on the free list (or being placed there) and the caller must hold an
    /// atomic section.
    unsafe fn read_link(&self, index: u32) -> u32 {
        // SAFETY: Blocks are `BLOCK_ALIGN`-aligned and at least that large, so the first word is
        // an aligned, in-bounds `u32`. Free blocks have no owner that could access it concurrently.
        unsafe { self.block_ptr(index).cast::<u32>().read() }
    }

    /// # Safety
    ///
    /// Same as `read_link()`.
    unsafe fn write_link(&self, index: u32, next: u32) {
        // SAFETY: See `read_link()`.
        unsafe { self.block_ptr(index).cast::<u32>().write(next) }
    }

    fn pop_free(&self) -> Option<u32> {
        atomically(|cs| {
            let cell = self.free_list.borrow(cs);
            let mut free_list = cell.get();

            if free_list.head == NIL {
                free_list.exhausted = free_list.exhausted.wrapping_add(1);
                cell.set(free_list);
                return None;
            }

            let index = free_list.head;

            // SAFETY: `index` is the free-list head and we hold the section.
            free_list.head = unsafe { self.read_link(index) };
            free_list.available = free_list
                .available
                .checked_sub(1)
                .expect("a non-empty free list has a non-zero count");
            free_list.low_water = free_list.low_water.min(free_list.available);

            cell.set(free_list);
            Some(index)
        })
    }

    /// Pushes a block back onto the free list. Only called by `Block::drop()`, which guarantees
    /// the block is not on the free list already.
    pub(crate) fn push_free(&self, index: u32) {
        atomically(|cs| {
            let cell = self.free_list.borrow(cs);
            let mut free_list = cell.get();

            // SAFETY: The block's owner is giving it up, so nobody else touches it any more.
            unsafe {
                self.write_link(index, free_list.head);
            }

            free_list.head = index;
            free_list.available = free_list
                .available
                .checked_add(1)
                .expect("cannot free more blocks than the pool contains");

            cell.set(free_list);
        });

        trace!(pool = %self.name, index, "block freed");
    }

    #[cfg(test)]
    fn integrity_check(&self) {
        atomically(|cs| {
            let free_list = self.free_list.borrow(cs).get();

            let mut seen = vec![false; self.block_count as usize];
            let mut walked: u32 = 0;
            let mut cursor = free_list.head;

            while cursor != NIL {
                assert!(
                    cursor < self.block_count,
                    "free list of pool '{}' links to out-of-bounds block {cursor}",
                    self.name
                );

                let seen_before = seen
                    .get_mut(cursor as usize)
                    .expect("guarded by bounds assertion above");
                assert!(
                    !*seen_before,
                    "free list of pool '{}' visits block {cursor} twice",
                    self.name
                );
                *seen_before = true;

                walked = walked.checked_add(1).expect("bounded by block count");

                // SAFETY: The cursor is on the free list and we hold the section.
                cursor = unsafe { self.read_link(cursor) };
            }

            assert_eq!(
                walked, free_list.available,
                "free list of pool '{}' length does not match its available count",
                self.name
            );
        });
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        if let Backing::Owned(layout) = self.backing {
            // SAFETY: The region was allocated with this layout by the builder and no block can
            // outlive the core because every block holds a reference to it.
            unsafe {
                dealloc(self.base.as_ptr(), layout);
            }
        }
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

// SAFETY: The region is only reached through the pool core. Free-list words are only touched
// inside an atomic section and block contents only by the single owner of each `Block`.
unsafe impl Send for PoolCore {}
// SAFETY: See `Send` above; shared access never creates overlapping mutable access.
unsafe impl Sync for PoolCore {}
