use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::router::RouteCounters;
use crate::{Block, DestinationId, Error, Failure, PacketStatus, Result, StatusHandler};

/// A payload in a pool block on its way to a destination, together with the handler that
/// receives its final status.
///
/// Once a router accepts a packet, the status handler is invoked exactly once: when the
/// destination finishes the [`Delivery`], when queuing fails, or with
/// [`Failure::Abandoned`] if the packet is dropped before either happens. The block is always
/// returned to its pool before the handler runs.
pub struct Packet {
    buffer: Option<Block>,
    len: usize,
    status: Option<StatusHandler>,

    /// Tick at which the router accepted the packet.
    submitted_at: u64,
    accepted: bool,
}

impl Packet {
    /// Wraps the first `len` bytes of `buffer` as the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oversized`] if `len` exceeds the capacity of the block. The block goes
    /// back to its pool and the status handler is dropped without being invoked.
    pub fn new(buffer: Block, len: usize, status: StatusHandler) -> Result<Self> {
        if len > buffer.capacity() {
            return Err(Error::Oversized {
                requested: len,
                capacity: buffer.capacity(),
            });
        }

        Ok(Self {
            buffer: Some(buffer),
            len,
            status: Some(status),
            submitted_at: 0,
            accepted: false,
        })
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.buffer
            .as_deref()
            .and_then(|buffer| buffer.get(..self.len))
            .expect("the buffer is present and the length was checked at creation")
    }

    /// The payload bytes, mutably.
    #[must_use]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.len;

        self.buffer
            .as_deref_mut()
            .and_then(|buffer| buffer.get_mut(..len))
            .expect("the buffer is present and the length was checked at creation")
    }

    /// The payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn accept(&mut self, now: u64) {
        self.accepted = true;
        self.submitted_at = now;
    }

    pub(crate) fn submitted_at(&self) -> u64 {
        self.submitted_at
    }

    /// Releases the block, then reports `status`.
    pub(crate) fn finish(mut self, status: PacketStatus) {
        self.release_and_report(status);
    }

    fn release_and_report(&mut self, status: PacketStatus) {
        drop(self.buffer.take());

        if let Some(handler) = self.status.take() {
            handler.report(status);
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if self.accepted {
            self.release_and_report(PacketStatus::Failed(Failure::Abandoned));
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .field("status", &self.status)
            .field("submitted_at", &self.submitted_at)
            .field("accepted", &self.accepted)
            .finish()
    }
}

/// A packet handed to a destination handler, which must finish it exactly once.
///
/// The handler may finish the delivery before returning or move it elsewhere (for example to a
/// worker thread) and finish it later. Finishing returns the block to its pool and then reports
/// the status to the submitter. Dropping an unfinished delivery reports
/// [`Failure::Abandoned`].
pub struct Delivery {
    packet: Option<Packet>,
    counters: Arc<RouteCounters>,
    destination: DestinationId,
}

impl Delivery {
    pub(crate) fn new(
        packet: Packet,
        counters: Arc<RouteCounters>,
        destination: DestinationId,
    ) -> Self {
        Self {
            packet: Some(packet),
            counters,
            destination,
        }
    }

    fn packet(&self) -> &Packet {
        self.packet
            .as_ref()
            .expect("only taken when the delivery is consumed")
    }

    /// The destination the packet was submitted to.
    #[must_use]
    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.packet().payload()
    }

    /// The payload bytes, mutably. Useful for handlers that transform the payload in place
    /// before forwarding it.
    #[must_use]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.packet
            .as_mut()
            .expect("only taken when the delivery is consumed")
            .payload_mut()
    }

    /// The payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packet().len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packet().is_empty()
    }

    /// Finishes the delivery successfully.
    pub fn complete(self) {
        self.finish(PacketStatus::Completed);
    }

    /// Finishes the delivery with a handler-specific failure code, forwarded verbatim to the
    /// submitter.
    pub fn fail(self, code: u32) {
        self.finish(PacketStatus::Failed(Failure::Handler(code)));
    }

    /// Finishes the delivery with `status`.
    pub fn finish(mut self, status: PacketStatus) {
        self.finish_in_place(status);
    }

    fn finish_in_place(&mut self, status: PacketStatus) {
        if let Some(packet) = self.packet.take() {
            self.counters.record_finished(status);
            packet.finish(status);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.packet.is_some() {
            warn!(
                destination = %self.destination,
                "delivery dropped without a final status, reporting it as abandoned"
            );

            self.finish_in_place(PacketStatus::Failed(Failure::Abandoned));
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("destination", &self.destination)
            .field("packet", &self.packet)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::BlockPool;

    assert_impl_all!(Packet: Send, fmt::Debug);
    assert_impl_all!(Delivery: Send, fmt::Debug);

    fn pool() -> BlockPool {
        BlockPool::builder()
            .block_size(16)
            .block_count(2)
            .build()
            .unwrap()
    }

    #[test]
    fn oversized_payload_is_rejected_and_block_returned() {
        let pool = pool();
        let (handler, completion) = StatusHandler::completion();

        let result = Packet::new(pool.alloc().unwrap(), 17, handler);

        assert!(matches!(
            result,
            Err(Error::Oversized {
                requested: 17,
                capacity: 16
            })
        ));
        assert_eq!(pool.available(), 2);

        // Not accepted, so nothing was reported; the channel just closed.
        assert_eq!(
            completion.try_status(),
            Some(PacketStatus::Failed(Failure::Abandoned))
        );
    }

    #[test]
    fn payload_is_limited_to_length() {
        let pool = pool();
        let mut block = pool.alloc().unwrap();
        block[..3].copy_from_slice(b"abc");

        let mut packet = Packet::new(block, 3, StatusHandler::none()).unwrap();
        assert_eq!(packet.payload(), b"abc");

        packet.payload_mut()[0] = b'x';
        assert_eq!(packet.payload(), b"xbc");
        assert_eq!(packet.len(), 3);
        assert!(!packet.is_empty());
    }

    #[test]
    fn accepted_packet_dropped_reports_abandoned_after_release() {
        let pool = pool();
        let observer = pool.clone();

        let handler = StatusHandler::boxed(move |status| {
            assert_eq!(status, PacketStatus::Failed(Failure::Abandoned));
            assert_eq!(observer.available(), 2);
        });

        let mut packet = Packet::new(pool.alloc().unwrap(), 0, handler).unwrap();
        packet.accept(5);
        assert_eq!(packet.submitted_at(), 5);

        drop(packet);
    }

    #[test]
    fn finish_releases_buffer_before_reporting() {
        let pool = pool();
        let observer = pool.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let handler = StatusHandler::boxed(move |status| {
            tx.send((status, observer.available())).unwrap();
        });

        let mut packet = Packet::new(pool.alloc().unwrap(), 4, handler).unwrap();
        packet.accept(0);

        let delivery = Delivery::new(
            packet,
            Arc::new(RouteCounters::default()),
            DestinationId(1),
        );
        assert_eq!(delivery.len(), 4);
        delivery.fail(0x22);

        assert_eq!(
            rx.recv().unwrap(),
            (PacketStatus::Failed(Failure::Handler(0x22)), 2)
        );
    }

    #[test]
    fn dropped_delivery_counts_as_failed() {
        let pool = pool();
        let counters = Arc::new(RouteCounters::default());
        let (handler, completion) = StatusHandler::completion();

        let mut packet = Packet::new(pool.alloc().unwrap(), 1, handler).unwrap();
        packet.accept(0);

        drop(Delivery::new(packet, Arc::clone(&counters), DestinationId(3)));

        assert_eq!(completion.wait(), PacketStatus::Failed(Failure::Abandoned));
        assert_eq!(counters.snapshot(0).failed, 1);
        assert_eq!(pool.available(), 2);
    }
}
