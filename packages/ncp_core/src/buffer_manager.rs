//! Sets of block pools that serve variably sized buffer requests.

use std::any::type_name;
use std::fmt;

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, trace};

use crate::{Block, BlockPool, Error, Resource, Result};

/// Identifies one dedicated pool of a [`BufferManager`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(pub u16);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool {}", self.0)
    }
}

/// Which pools a [`BufferManager`] may draw a buffer from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocationPolicy {
    /// Only the requested dedicated pool.
    #[default]
    Dedicated,

    /// The requested dedicated pool first, the common pool if the dedicated pool is exhausted or
    /// its blocks are too small.
    Hybrid,
}

/// A set of dedicated block pools, each reserved for one kind of traffic, plus an optional
/// common pool shared by everyone as overflow capacity.
///
/// Every pool keeps the guarantees of [`BlockPool`]: fixed capacity, O(1) allocation, no
/// blocking. The manager only decides which pool serves a request.
///
/// # Examples
///
/// ```
/// use ncp_core::{AllocationPolicy, BufferManager, PoolId};
///
/// const CONTROL: PoolId = PoolId(1);
///
/// let buffers = BufferManager::builder()
///     .dedicated(CONTROL, 64, 1)
///     .common(512, 8)
///     .build()?;
///
/// let _first = buffers.allocate(CONTROL, AllocationPolicy::Dedicated, 32)?;
///
/// // The dedicated pool is exhausted, but hybrid requests fall back to the common pool.
/// assert!(buffers.allocate(CONTROL, AllocationPolicy::Dedicated, 32).is_err());
/// let second = buffers.allocate(CONTROL, AllocationPolicy::Hybrid, 32)?;
/// assert_eq!(second.capacity(), 512);
/// # Ok::<(), ncp_core::Error>(())
/// ```
pub struct BufferManager {
    dedicated: HashMap<PoolId, BlockPool>,
    common: Option<BlockPool>,
}

impl BufferManager {
    /// Starts building a new [`BufferManager`].
    pub fn builder() -> BufferManagerBuilder {
        BufferManagerBuilder::new()
    }

    /// Allocates a buffer of at least `size` bytes on behalf of the dedicated pool `pool`.
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownPool`] if `pool` was not configured.
    /// * [`Error::Oversized`] if no pool the policy permits has blocks of at least `size` bytes.
    /// * [`Error::ResourceExhausted`] if every suitable pool the policy permits is exhausted.
    pub fn allocate(&self, pool: PoolId, policy: AllocationPolicy, size: usize) -> Result<Block> {
        let dedicated = self
            .dedicated
            .get(&pool)
            .ok_or(Error::UnknownPool { pool })?;

        let dedicated_result = allocate_from(dedicated, size);

        match (dedicated_result, policy, &self.common) {
            (Ok(block), _, _) => Ok(block),
            (Err(error), AllocationPolicy::Hybrid, Some(common)) => {
                trace!(%pool, size, %error, "falling back to common pool");

                allocate_from(common, size).map_err(|common_error| {
                    // A too-small common pool says less about the request than the dedicated one.
                    if matches!(common_error, Error::Oversized { .. }) {
                        error
                    } else {
                        common_error
                    }
                })
            }
            (Err(error), _, _) => Err(error),
        }
    }

    /// Allocates a buffer of at least `size` bytes from the common pool.
    ///
    /// # Errors
    ///
    /// * [`Error::ResourceExhausted`] if there is no common pool or it is exhausted.
    /// * [`Error::Oversized`] if the common blocks are smaller than `size` bytes.
    pub fn allocate_common(&self, size: usize) -> Result<Block> {
        let common = self.common.as_ref().ok_or(Error::ResourceExhausted {
            resource: Resource::Blocks,
        })?;

        allocate_from(common, size)
    }

    /// The dedicated pool registered as `pool`, if any.
    #[must_use]
    pub fn pool(&self, pool: PoolId) -> Option<&BlockPool> {
        self.dedicated.get(&pool)
    }

    /// The common pool, if one was configured.
    #[must_use]
    pub fn common(&self) -> Option<&BlockPool> {
        self.common.as_ref()
    }
}

fn allocate_from(pool: &BlockPool, size: usize) -> Result<Block> {
    if size > pool.block_size() {
        return Err(Error::Oversized {
            requested: size,
            capacity: pool.block_size(),
        });
    }

    pool.alloc()
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.dedicated.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();

        f.debug_struct(type_name::<Self>())
            .field("dedicated", &ids)
            .field("common", &self.common)
            .finish()
    }
}

enum PoolSpec {
    Sized {
        block_size: usize,
        block_count: usize,
    },
    Prebuilt(BlockPool),
}

impl PoolSpec {
    fn build(self, name: String) -> Result<BlockPool> {
        match self {
            Self::Sized {
                block_size,
                block_count,
            } => BlockPool::builder()
                .name(name)
                .block_size(block_size)
                .block_count(block_count)
                .build(),
            Self::Prebuilt(pool) => Ok(pool),
        }
    }
}

impl fmt::Debug for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sized {
                block_size,
                block_count,
            } => write!(f, "{block_count} x {block_size} bytes"),
            Self::Prebuilt(pool) => fmt::Debug::fmt(pool, f),
        }
    }
}

/// Builder for creating an instance of [`BufferManager`].
///
/// At least one pool must be configured. Pools given by size are created by `build()`; pools
/// created elsewhere (for example over a caller-supplied region) can be handed in as they are.
#[derive(Debug)]
#[must_use]
pub struct BufferManagerBuilder {
    dedicated: Vec<(PoolId, PoolSpec)>,
    common: Option<PoolSpec>,
}

impl BufferManagerBuilder {
    fn new() -> Self {
        Self {
            dedicated: Vec::new(),
            common: None,
        }
    }

    /// Adds a dedicated pool of `block_count` blocks of `block_size` bytes.
    pub fn dedicated(mut self, pool: PoolId, block_size: usize, block_count: usize) -> Self {
        self.dedicated.push((
            pool,
            PoolSpec::Sized {
                block_size,
                block_count,
            },
        ));
        self
    }

    /// Adds an existing block pool as a dedicated pool.
    pub fn dedicated_pool(mut self, pool: PoolId, block_pool: BlockPool) -> Self {
        self.dedicated.push((pool, PoolSpec::Prebuilt(block_pool)));
        self
    }

    /// Sets the common pool to `block_count` blocks of `block_size` bytes.
    pub fn common(mut self, block_size: usize, block_count: usize) -> Self {
        self.common = Some(PoolSpec::Sized {
            block_size,
            block_count,
        });
        self
    }

    /// Sets an existing block pool as the common pool.
    pub fn common_pool(mut self, block_pool: BlockPool) -> Self {
        self.common = Some(PoolSpec::Prebuilt(block_pool));
        self
    }

    /// Creates every pool and returns the manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no pool was configured, a pool id was used twice or a
    /// pool rejected its parameters. Returns [`Error::ResourceExhausted`] if pool memory could not
    /// be allocated.
    pub fn build(self) -> Result<BufferManager> {
        if self.dedicated.is_empty() && self.common.is_none() {
            return Err(Error::configuration(
                "a buffer manager needs at least one pool",
            ));
        }

        let mut dedicated = HashMap::with_capacity(self.dedicated.len());

        for (id, spec) in self.dedicated {
            if dedicated.contains_key(&id) {
                return Err(Error::configuration(format!("{id} is configured twice")));
            }

            dedicated.insert(id, spec.build(format!("dedicated-{}", id.0))?);
        }

        let common = self
            .common
            .map(|spec| spec.build(String::from("common")))
            .transpose()?;

        debug!(
            dedicated = dedicated.len(),
            common = common.is_some(),
            "buffer manager created"
        );

        Ok(BufferManager { dedicated, common })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BufferManager: Send, Sync, fmt::Debug);

    const RX: PoolId = PoolId(1);
    const TX: PoolId = PoolId(2);

    fn manager() -> BufferManager {
        BufferManager::builder()
            .dedicated(RX, 64, 2)
            .dedicated(TX, 128, 1)
            .common(256, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn dedicated_policy_never_touches_common_pool() {
        let buffers = manager();

        let _a = buffers.allocate(RX, AllocationPolicy::Dedicated, 64).unwrap();
        let _b = buffers.allocate(RX, AllocationPolicy::Dedicated, 1).unwrap();

        let exhausted = buffers.allocate(RX, AllocationPolicy::Dedicated, 1);
        assert!(matches!(
            exhausted,
            Err(Error::ResourceExhausted {
                resource: Resource::Blocks
            })
        ));
        assert_eq!(buffers.common().unwrap().available(), 2);
    }

    #[test]
    fn hybrid_policy_falls_back_when_exhausted() {
        let buffers = manager();

        let first = buffers.allocate(TX, AllocationPolicy::Hybrid, 100).unwrap();
        assert_eq!(first.capacity(), 128);

        let second = buffers.allocate(TX, AllocationPolicy::Hybrid, 100).unwrap();
        assert_eq!(second.capacity(), 256);
        assert_eq!(buffers.common().unwrap().available(), 1);
    }

    #[test]
    fn hybrid_policy_falls_back_when_too_small() {
        let buffers = manager();

        let block = buffers.allocate(RX, AllocationPolicy::Hybrid, 200).unwrap();

        assert_eq!(block.capacity(), 256);
        assert_eq!(buffers.pool(RX).unwrap().available(), 2);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let buffers = manager();

        let result = buffers.allocate(RX, AllocationPolicy::Dedicated, 65);
        assert!(matches!(
            result,
            Err(Error::Oversized {
                requested: 65,
                capacity: 64
            })
        ));

        let result = buffers.allocate(RX, AllocationPolicy::Hybrid, 1000);
        assert!(matches!(
            result,
            Err(Error::Oversized {
                requested: 1000,
                capacity: 64
            })
        ));
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let buffers = manager();

        let result = buffers.allocate(PoolId(9), AllocationPolicy::Hybrid, 1);

        assert!(matches!(result, Err(Error::UnknownPool { pool: PoolId(9) })));
    }

    #[test]
    fn allocate_common_without_common_pool_is_exhausted() {
        let buffers = BufferManager::builder()
            .dedicated(RX, 64, 1)
            .build()
            .unwrap();

        assert!(matches!(
            buffers.allocate_common(1),
            Err(Error::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn empty_configuration_is_rejected() {
        assert!(matches!(
            BufferManager::builder().build(),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn duplicate_pool_id_is_rejected() {
        let result = BufferManager::builder()
            .dedicated(RX, 64, 1)
            .dedicated(RX, 128, 1)
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn invalid_pool_parameters_are_rejected() {
        let result = BufferManager::builder().dedicated(RX, 64, 0).build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn prebuilt_pools_are_used_as_given() {
        let pool = BlockPool::builder()
            .block_size(32)
            .block_count(3)
            .build()
            .unwrap();

        let buffers = BufferManager::builder()
            .dedicated_pool(RX, pool.clone())
            .common_pool(pool.clone())
            .build()
            .unwrap();

        let _block = buffers.allocate_common(32).unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(buffers.pool(RX).unwrap().available(), 2);
    }

    #[test]
    fn pool_id_display() {
        assert_eq!(PoolId(3).to_string(), "pool 3");
    }
}
