//! Per-delivery payload accumulator.

use std::{collections::VecDeque, num::NonZeroUsize};

use bytes::{Bytes, BytesMut};

use super::ReassemblyError;
use crate::frames::DeliveryNumber;

/// Progress of a delivery's reassembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryProgress {
    /// No payload received yet.
    Empty,
    /// At least one frame received, more expected.
    Accumulating,
    /// Final frame received; payload is whole.
    Complete,
    /// The sender abandoned the delivery; payload is void.
    Aborted,
}

/// Accumulates the payload chunks of one delivery in arrival order.
///
/// State machine: `Empty → Accumulating → Complete | Aborted`. An aborted
/// frame wins over any accumulated payload regardless of its `more` flag.
#[derive(Debug)]
pub struct DeliveryBuffer {
    delivery_id: DeliveryNumber,
    progress: DeliveryProgress,
    chunks: VecDeque<Bytes>,
    accumulated: usize,
    /// Frames received but not yet surfaced to a reader; used to restore the
    /// session window when a delivery is discarded unread.
    unread_frames: u32,
    max_delivery_size: NonZeroUsize,
}

impl DeliveryBuffer {
    /// Create an empty buffer for `delivery_id` capped at `max_delivery_size`.
    #[must_use]
    pub const fn new(delivery_id: DeliveryNumber, max_delivery_size: NonZeroUsize) -> Self {
        Self {
            delivery_id,
            progress: DeliveryProgress::Empty,
            chunks: VecDeque::new(),
            accumulated: 0,
            unread_frames: 0,
            max_delivery_size,
        }
    }

    /// Delivery this buffer belongs to.
    #[must_use]
    pub const fn delivery_id(&self) -> DeliveryNumber { self.delivery_id }

    /// Current reassembly progress.
    #[must_use]
    pub const fn progress(&self) -> DeliveryProgress { self.progress }

    /// Whether the final frame has been received.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.progress, DeliveryProgress::Complete)
    }

    /// Whether the delivery was aborted.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.progress, DeliveryProgress::Aborted)
    }

    /// Total payload bytes accumulated so far.
    #[must_use]
    pub const fn len(&self) -> usize { self.accumulated }

    /// Whether no payload has been accumulated.
    #[must_use]
    pub const fn is_empty(&self) -> bool { self.accumulated == 0 }

    /// Frames buffered and not yet handed to a reader.
    #[must_use]
    pub const fn unread_frames(&self) -> u32 { self.unread_frames }

    /// Feed one transfer frame's payload into the buffer.
    ///
    /// `more=false` completes the delivery; `aborted=true` voids it with
    /// precedence over `more`. Returns the resulting progress.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::AlreadyComplete`] or
    /// [`ReassemblyError::Aborted`] when the buffer is already terminal, and
    /// [`ReassemblyError::DeliveryTooLarge`] when the payload would exceed
    /// the configured cap.
    pub fn push(
        &mut self,
        payload: Bytes,
        more: bool,
        aborted: bool,
    ) -> Result<DeliveryProgress, ReassemblyError> {
        match self.progress {
            DeliveryProgress::Complete => {
                return Err(ReassemblyError::AlreadyComplete {
                    delivery_id: self.delivery_id,
                });
            }
            DeliveryProgress::Aborted => {
                return Err(ReassemblyError::Aborted {
                    delivery_id: self.delivery_id,
                });
            }
            DeliveryProgress::Empty | DeliveryProgress::Accumulating => {}
        }

        if aborted {
            self.progress = DeliveryProgress::Aborted;
            self.chunks.clear();
            self.accumulated = 0;
            return Ok(self.progress);
        }

        let attempted = self.accumulated.saturating_add(payload.len());
        if attempted > self.max_delivery_size.get() {
            return Err(ReassemblyError::DeliveryTooLarge {
                delivery_id: self.delivery_id,
                attempted,
                limit: self.max_delivery_size,
            });
        }

        if !payload.is_empty() {
            self.accumulated = attempted;
            self.chunks.push_back(payload);
        }
        self.unread_frames = self.unread_frames.saturating_add(1);
        self.progress = if more {
            DeliveryProgress::Accumulating
        } else {
            DeliveryProgress::Complete
        };
        Ok(self.progress)
    }

    /// Take the chunks accumulated since the last call, marking their frames
    /// as read.
    pub fn take_chunks(&mut self) -> Vec<Bytes> {
        self.unread_frames = 0;
        self.chunks.drain(..).collect()
    }

    /// Next unread chunk, if any, without removing it.
    #[must_use]
    pub fn peek_chunk(&self) -> Option<Bytes> { self.chunks.front().cloned() }

    /// Remove the chunk last peeked, marking its frame as read.
    pub fn pop_chunk(&mut self) {
        if self.chunks.pop_front().is_some() {
            self.unread_frames = self.unread_frames.saturating_sub(1);
        }
    }

    /// Consume the buffer, concatenating all chunks into one payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => {
                let mut chunks = self.chunks;
                chunks.pop_front().unwrap_or_default()
            }
            _ => {
                let mut buffer = BytesMut::with_capacity(self.accumulated);
                for chunk in &self.chunks {
                    buffer.extend_from_slice(chunk);
                }
                buffer.freeze()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;

    use super::{DeliveryBuffer, DeliveryProgress};
    use crate::reassembly::ReassemblyError;

    fn cap(bytes: usize) -> NonZeroUsize {
        NonZeroUsize::new(bytes).expect("non-zero cap")
    }

    fn buffer() -> DeliveryBuffer { DeliveryBuffer::new(1, cap(1024)) }

    #[test]
    fn single_frame_completes_immediately() {
        let mut buf = buffer();
        let progress = buf
            .push(Bytes::from_static(b"whole"), false, false)
            .expect("accepted");
        assert_eq!(progress, DeliveryProgress::Complete);
        assert_eq!(buf.into_bytes(), Bytes::from_static(b"whole"));
    }

    #[test]
    fn split_frames_concatenate_in_order() {
        let mut buf = buffer();
        assert_eq!(
            buf.push(Bytes::from_static(b"ab"), true, false).expect("accepted"),
            DeliveryProgress::Accumulating
        );
        assert_eq!(
            buf.push(Bytes::from_static(b"cd"), true, false).expect("accepted"),
            DeliveryProgress::Accumulating
        );
        assert!(!buf.is_complete());
        assert_eq!(
            buf.push(Bytes::from_static(b"ef"), false, false).expect("accepted"),
            DeliveryProgress::Complete
        );
        assert!(buf.is_complete());
        assert_eq!(buf.into_bytes(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn abort_wins_regardless_of_more_flag() {
        let mut buf = buffer();
        buf.push(Bytes::from_static(b"partial"), true, false)
            .expect("accepted");
        let progress = buf
            .push(Bytes::new(), false, true)
            .expect("abort accepted");
        assert_eq!(progress, DeliveryProgress::Aborted);
        assert!(buf.is_aborted());
        assert!(!buf.is_complete());
        assert!(buf.is_empty());
    }

    #[test]
    fn terminal_states_reject_further_frames() {
        let mut buf = buffer();
        buf.push(Bytes::from_static(b"x"), false, false)
            .expect("accepted");
        assert_eq!(
            buf.push(Bytes::from_static(b"y"), false, false),
            Err(ReassemblyError::AlreadyComplete { delivery_id: 1 })
        );

        let mut buf = buffer();
        buf.push(Bytes::new(), false, true).expect("abort accepted");
        assert_eq!(
            buf.push(Bytes::from_static(b"y"), false, false),
            Err(ReassemblyError::Aborted { delivery_id: 1 })
        );
    }

    #[test]
    fn size_cap_is_enforced() {
        let mut buf = DeliveryBuffer::new(9, cap(4));
        buf.push(Bytes::from_static(b"abc"), true, false)
            .expect("within cap");
        let err = buf
            .push(Bytes::from_static(b"de"), false, false)
            .expect_err("over cap");
        assert_eq!(
            err,
            ReassemblyError::DeliveryTooLarge {
                delivery_id: 9,
                attempted: 5,
                limit: cap(4),
            }
        );
    }

    #[test]
    fn peek_and_pop_hand_out_chunks_one_frame_at_a_time() {
        let mut buf = buffer();
        buf.push(Bytes::from_static(b"a"), true, false).expect("accepted");
        buf.push(Bytes::from_static(b"b"), true, false).expect("accepted");
        assert_eq!(buf.peek_chunk(), Some(Bytes::from_static(b"a")));
        // Peeking leaves the frame unread until it is popped.
        assert_eq!(buf.unread_frames(), 2);
        buf.pop_chunk();
        assert_eq!(buf.unread_frames(), 1);
        assert_eq!(buf.peek_chunk(), Some(Bytes::from_static(b"b")));
        buf.pop_chunk();
        assert_eq!(buf.peek_chunk(), None);
        assert_eq!(buf.unread_frames(), 0);
        // Popping with nothing buffered is harmless.
        buf.pop_chunk();
        assert_eq!(buf.unread_frames(), 0);
    }

    #[test]
    fn take_chunks_resets_unread_frame_count() {
        let mut buf = buffer();
        buf.push(Bytes::from_static(b"a"), true, false).expect("accepted");
        buf.push(Bytes::from_static(b"b"), true, false).expect("accepted");
        assert_eq!(buf.unread_frames(), 2);
        let chunks = buf.take_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(buf.unread_frames(), 0);
        buf.push(Bytes::from_static(b"c"), false, false).expect("accepted");
        assert_eq!(buf.unread_frames(), 1);
        assert_eq!(buf.take_chunks(), vec![Bytes::from_static(b"c")]);
    }
}
