//! Final status reporting for submitted packets.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Error, Resource, Result};

/// The final status of a packet, reported exactly once to its [`StatusHandler`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketStatus {
    /// The destination handler processed the packet successfully.
    Completed,

    /// The packet was not processed successfully.
    Failed(Failure),
}

impl PacketStatus {
    /// Whether the packet completed successfully.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Converts the status into a `Result`, mapping each failure to the matching [`Error`].
    ///
    /// # Errors
    ///
    /// Returns an error for every [`PacketStatus::Failed`] status.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed(Failure::ResourceExhausted) => Err(Error::ResourceExhausted {
                resource: Resource::QueueNodes,
            }),
            Self::Failed(Failure::Handler(status)) => Err(Error::HandlerFailure { status }),
            Self::Failed(Failure::Abandoned) => Err(Error::Abandoned),
        }
    }
}

/// Why a packet failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Failure {
    /// The destination queue had no free node, so the packet was never queued.
    ResourceExhausted,

    /// The destination handler reported this handler-specific status code.
    Handler(u32),

    /// The packet was discarded before reaching a final status, for example because its
    /// delivery was dropped unfinished or its destination queue was torn down.
    Abandoned,
}

/// Receives the final status of one submitted packet.
///
/// A handler is consumed when it reports, so it is invoked exactly once per accepted packet. It
/// runs after the packet buffer was returned to its pool, in whatever context finished the
/// packet (the consumer, or the submitter for synchronous failures), so it must be short and
/// must not block.
pub struct StatusHandler {
    kind: Kind,
}

enum Kind {
    None,
    Callback {
        callback: fn(PacketStatus, usize),
        context: usize,
    },
    Boxed(Box<dyn FnOnce(PacketStatus) + Send>),
    Channel(oneshot::Sender<PacketStatus>),
}

impl StatusHandler {
    /// A handler that ignores the status.
    #[must_use]
    pub fn none() -> Self {
        Self { kind: Kind::None }
    }

    /// A plain function called with the status and an opaque context word.
    #[must_use]
    pub fn from_fn(callback: fn(PacketStatus, usize), context: usize) -> Self {
        Self {
            kind: Kind::Callback { callback, context },
        }
    }

    /// A closure called with the status.
    #[must_use]
    pub fn boxed(callback: impl FnOnce(PacketStatus) + Send + 'static) -> Self {
        Self {
            kind: Kind::Boxed(Box::new(callback)),
        }
    }

    /// A handler paired with a [`Completion`] that resolves to the status.
    ///
    /// # Examples
    ///
    /// ```
    /// use ncp_core::{PacketStatus, StatusHandler};
    ///
    /// let (handler, completion) = StatusHandler::completion();
    /// # drop(handler);
    /// // Dropping the handler without reporting counts as abandoning the packet.
    /// assert!(!completion.wait().is_completed());
    /// ```
    #[must_use]
    pub fn completion() -> (Self, Completion) {
        let (sender, receiver) = oneshot::channel();

        (
            Self {
                kind: Kind::Channel(sender),
            },
            Completion { receiver },
        )
    }

    /// Whether the handler ignores the status.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self.kind, Kind::None)
    }

    pub(crate) fn report(self, status: PacketStatus) {
        match self.kind {
            Kind::None => {}
            Kind::Callback { callback, context } => callback(status, context),
            Kind::Boxed(callback) => callback(status),
            Kind::Channel(sender) => {
                // Nobody waiting for the status is fine.
                drop(sender.send(status));
            }
        }
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for StatusHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::None => "none",
            Kind::Callback { .. } => "callback",
            Kind::Boxed(_) => "boxed",
            Kind::Channel(_) => "completion",
        };

        f.debug_struct(type_name::<Self>())
            .field("kind", &kind)
            .finish()
    }
}

/// Resolves to the final status of a packet submitted with the handler from
/// [`StatusHandler::completion()`].
///
/// If the handler is dropped without reporting, the completion resolves to
/// `PacketStatus::Failed(Failure::Abandoned)`.
#[must_use = "the status is lost unless the completion is awaited or waited on"]
pub struct Completion {
    receiver: oneshot::Receiver<PacketStatus>,
}

impl Completion {
    /// The status, if it has been reported already. Does not block.
    #[must_use]
    pub fn try_status(&self) -> Option<PacketStatus> {
        match self.receiver.try_recv() {
            Ok(status) => Some(status),
            Err(oneshot::TryRecvError::Empty) => None,
            Err(oneshot::TryRecvError::Disconnected) => {
                Some(PacketStatus::Failed(Failure::Abandoned))
            }
        }
    }

    /// Blocks the current thread until the status is reported.
    pub fn wait(self) -> PacketStatus {
        self.receiver
            .recv()
            .unwrap_or(PacketStatus::Failed(Failure::Abandoned))
    }
}

impl Future for Completion {
    type Output = PacketStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(PacketStatus::Failed(Failure::Abandoned)))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}
