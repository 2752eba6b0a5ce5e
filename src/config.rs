//! Engine configuration types.
//!
//! Options follow the containment hierarchy: connection, session, link, and
//! per-call settings. Timeouts resolve most-specific-wins through
//! [`resolve_timeout`]; a fully unset chain means "block indefinitely".

use std::{num::NonZeroUsize, time::Duration};

use crate::window::WindowPolicy;

/// Default cap on a single reassembled delivery payload.
pub const DEFAULT_MAX_DELIVERY_SIZE: NonZeroUsize =
    NonZeroUsize::new(16 * 1024 * 1024).unwrap();

/// Default session incoming capacity in bytes.
pub const DEFAULT_INCOMING_CAPACITY: u64 = 1024 * 1024;

/// Default maximum transfer frame size assumed for window accounting.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Default streaming write buffer threshold before an automatic flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Default chunk buffer per surfaced streaming delivery.
pub const DEFAULT_READ_BUFFER_FRAMES: usize = 16;

/// Resolve an operation deadline from the most specific configured value.
///
/// Precedence: per-call, then link, then session, then connection. `None`
/// throughout blocks indefinitely.
#[must_use]
pub fn resolve_timeout(
    per_call: Option<Duration>,
    link: Option<Duration>,
    session: Option<Duration>,
    connection: Option<Duration>,
) -> Option<Duration> {
    per_call.or(link).or(session).or(connection)
}

/// Connection-wide defaults inherited by sessions and links.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionOptions {
    /// Default deadline for blocking operations.
    pub operation_timeout: Option<Duration>,
}

impl ConnectionOptions {
    /// Set the connection-wide operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

/// Per-session window and buffering configuration.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Deadline for blocking operations on this session's links.
    pub operation_timeout: Option<Duration>,
    /// Byte capacity converted to the incoming frame window.
    pub incoming_capacity_bytes: u64,
    /// Frame size used for window accounting.
    pub max_frame_size: u32,
    /// Byte-to-frame conversion policy.
    pub window_policy: WindowPolicy,
    /// Cap on a single reassembled delivery.
    pub max_delivery_size: NonZeroUsize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            incoming_capacity_bytes: DEFAULT_INCOMING_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            window_policy: WindowPolicy::default(),
            max_delivery_size: DEFAULT_MAX_DELIVERY_SIZE,
        }
    }
}

impl SessionOptions {
    /// Set the session operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set the incoming byte capacity.
    #[must_use]
    pub const fn with_incoming_capacity(mut self, bytes: u64) -> Self {
        self.incoming_capacity_bytes = bytes;
        self
    }

    /// Set the frame size used for window accounting.
    #[must_use]
    pub const fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

/// Per-receiver configuration.
#[derive(Clone, Copy, Debug)]
pub struct ReceiverOptions {
    /// Deadline for blocking operations on this link.
    pub operation_timeout: Option<Duration>,
    /// Auto-replenished credit window; `None` means manual credit.
    pub credit_window: Option<u32>,
    /// Automatically accept deliveries as they are consumed.
    pub auto_accept: bool,
    /// Deadline for a drain cycle, overriding the operation timeout.
    pub drain_timeout: Option<Duration>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            credit_window: Some(10),
            auto_accept: true,
            drain_timeout: None,
        }
    }
}

impl ReceiverOptions {
    /// Set the credit window.
    #[must_use]
    pub const fn with_credit_window(mut self, window: u32) -> Self {
        self.credit_window = Some(window);
        self
    }

    /// Disable the credit window; credit is then managed manually.
    #[must_use]
    pub const fn with_manual_credit(mut self) -> Self {
        self.credit_window = None;
        self
    }

    /// Enable or disable automatic acceptance.
    #[must_use]
    pub const fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    /// Set the link operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set the drain deadline.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }
}

/// Per-stream-receiver configuration.
#[derive(Clone, Copy, Debug)]
pub struct StreamReceiverOptions {
    /// Link options shared with plain receivers.
    pub receiver: ReceiverOptions,
    /// Chunks buffered per delivery between the session task and the reader.
    pub read_buffer_frames: usize,
}

impl Default for StreamReceiverOptions {
    fn default() -> Self {
        Self {
            receiver: ReceiverOptions::default(),
            read_buffer_frames: DEFAULT_READ_BUFFER_FRAMES,
        }
    }
}

impl StreamReceiverOptions {
    /// Set the per-delivery chunk buffer.
    #[must_use]
    pub const fn with_read_buffer_frames(mut self, frames: usize) -> Self {
        self.read_buffer_frames = if frames == 0 { 1 } else { frames };
        self
    }
}

/// Per-sender configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct SenderOptions {
    /// Deadline for blocking operations on this link.
    pub operation_timeout: Option<Duration>,
}

impl SenderOptions {
    /// Set the link operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

/// Per-stream-sender configuration.
#[derive(Clone, Copy, Debug)]
pub struct StreamSenderOptions {
    /// Link options shared with plain senders.
    pub sender: SenderOptions,
    /// Buffered body bytes that trigger an automatic flush.
    pub flush_threshold: usize,
}

impl Default for StreamSenderOptions {
    fn default() -> Self {
        Self {
            sender: SenderOptions::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Options for a streaming message's body output stream.
#[derive(Clone, Copy, Debug)]
pub struct OutputStreamOptions {
    /// Declared body length; closing before writing this many bytes aborts
    /// the delivery.
    pub body_length: Option<u64>,
    /// Whether closing the stream completes the message.
    pub complete_on_close: bool,
}

impl Default for OutputStreamOptions {
    fn default() -> Self {
        Self {
            body_length: None,
            complete_on_close: true,
        }
    }
}

impl OutputStreamOptions {
    /// Declare a fixed body length.
    #[must_use]
    pub const fn with_body_length(mut self, length: u64) -> Self {
        self.body_length = Some(length);
        self
    }

    /// Control whether close completes the message.
    #[must_use]
    pub const fn with_complete_on_close(mut self, complete: bool) -> Self {
        self.complete_on_close = complete;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::resolve_timeout;

    #[test]
    fn most_specific_timeout_wins() {
        let call = Some(Duration::from_secs(1));
        let link = Some(Duration::from_secs(2));
        let session = Some(Duration::from_secs(3));
        let connection = Some(Duration::from_secs(4));

        assert_eq!(resolve_timeout(call, link, session, connection), call);
        assert_eq!(resolve_timeout(None, link, session, connection), link);
        assert_eq!(resolve_timeout(None, None, session, connection), session);
        assert_eq!(resolve_timeout(None, None, None, connection), connection);
        assert_eq!(resolve_timeout(None, None, None, None), None);
    }
}
