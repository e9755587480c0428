use std::fmt;

use thiserror::Error;

use crate::{DestinationId, PoolId};

/// Errors that can occur when configuring or using pools, queues and routes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Pool, queue or route parameters were rejected at creation time. The instance
    /// being created is not usable.
    #[error("invalid configuration: {problem}")]
    Configuration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// A fixed-capacity resource had nothing left to hand out. This is an expected
    /// condition under load; the caller decides whether to drop, retry or apply backpressure.
    #[error("{resource} exhausted")]
    ResourceExhausted {
        /// The resource that ran out.
        resource: Resource,
    },

    /// A packet was submitted to a destination that was never registered.
    #[error("no destination registered as {destination}")]
    UnknownDestination {
        /// The destination the packet was addressed to.
        destination: DestinationId,
    },

    /// A destination handler reported a failure. The status is forwarded verbatim.
    #[error("destination handler failed with status {status:#x}")]
    HandlerFailure {
        /// Handler-specific status code.
        status: u32,
    },

    /// A packet was accepted but discarded before anyone reported its final status.
    #[error("packet was abandoned before it reached a final status")]
    Abandoned,

    /// A payload length does not fit into the block that carries it.
    #[error("payload of {requested} bytes does not fit a {capacity}-byte block")]
    Oversized {
        /// The requested payload length.
        requested: usize,

        /// The capacity of the block.
        capacity: usize,
    },

    /// A buffer was requested from a pool the buffer manager was not configured with.
    #[error("no pool configured as {pool}")]
    UnknownPool {
        /// The requested pool.
        pool: PoolId,
    },
}

impl Error {
    pub(crate) fn configuration(problem: impl Into<String>) -> Self {
        Self::Configuration {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for this crate, returning the crate's [`Error`] type as the
/// error value.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies which fixed-capacity resource was exhausted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Resource {
    /// Free blocks of a block pool.
    Blocks,

    /// Free nodes of a queue node pool.
    QueueNodes,

    /// Memory to back a pool-owned region at creation time.
    BackingMemory,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocks => f.write_str("pool blocks"),
            Self::QueueNodes => f.write_str("queue nodes"),
            Self::BackingMemory => f.write_str("backing memory"),
        }
    }
}

/// A value that could not be enqueued because the node pool of the queue had no free nodes.
///
/// The rejected value is handed back to the caller, who keeps ownership of it.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    /// Returns the value that was rejected.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueueFull")
            .field(&format_args!("{}", std::any::type_name::<T>()))
            .finish()
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} exhausted", Resource::QueueNodes)
    }
}

impl<T> std::error::Error for QueueFull<T> {}

impl<T> From<QueueFull<T>> for Error {
    fn from(_: QueueFull<T>) -> Self {
        Self::ResourceExhausted {
            resource: Resource::QueueNodes,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(QueueFull<String>: Send, Sync, Debug);

    #[test]
    fn resource_exhausted_names_the_resource() {
        let error = Error::ResourceExhausted {
            resource: Resource::Blocks,
        };

        assert_eq!(error.to_string(), "pool blocks exhausted");
    }

    #[test]
    fn handler_failure_shows_status_verbatim() {
        let error = Error::HandlerFailure { status: 0x1d };

        assert_eq!(
            error.to_string(),
            "destination handler failed with status 0x1d"
        );
    }

    #[test]
    fn queue_full_returns_value_and_converts() {
        let rejected = QueueFull(String::from("frame"));
        assert_eq!(rejected.to_string(), "queue nodes exhausted");

        assert_eq!(rejected.into_inner(), "frame");

        let error: Error = QueueFull(5_u8).into();
        assert!(matches!(
            error,
            Error::ResourceExhausted {
                resource: Resource::QueueNodes
            }
        ));
    }
}
