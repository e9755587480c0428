use std::any::type_name;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::slice;
use std::sync::Arc;

use crate::BlockPool;
use crate::block_pool::PoolCore;

/// One fixed-size buffer allocated from a [`BlockPool`].
///
/// A block has exactly one owner. Dropping it returns it to the free list of the pool it came
/// from, so a block can neither leak nor be freed twice.
///
/// The contents are accessible as a byte slice through `Deref`. The slice always spans the full
/// block size; tracking how much of it is meaningful is up to the user (see
/// [`Packet`][crate::Packet]).
pub struct Block {
    core: Arc<PoolCore>,
    index: u32,
}

impl Block {
    pub(crate) fn new(core: Arc<PoolCore>, index: u32) -> Self {
        Self { core, index }
    }

    /// The size of the block in bytes, equal to the block size of its pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.block_size()
    }

    /// The position of the block within the region of its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Whether the block was allocated from `pool` (or any clone of it).
    #[must_use]
    pub fn belongs_to(&self, pool: &BlockPool) -> bool {
        Arc::ptr_eq(&self.core, pool.core())
    }

    pub(crate) fn pool_name(&self) -> &str {
        self.core.name()
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: The block lies inside the region of a live pool core, spans `block_size`
        // initialized bytes and is owned exclusively by `self` until dropped.
        unsafe { slice::from_raw_parts(self.core.block_ptr(self.index).as_ptr(), self.capacity()) }
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: As in `deref()`, and `&mut self` guarantees unique access.
        unsafe {
            slice::from_raw_parts_mut(self.core.block_ptr(self.index).as_ptr(), self.capacity())
        }
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for Block {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.core.push_free(self.index);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool", &self.core.name())
            .field("index", &self.index)
            .field("capacity", &self.capacity())
            .finish()
    }
}
