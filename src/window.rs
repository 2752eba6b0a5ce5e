//! Session transfer-window accounting.
//!
//! [`SessionWindow`] gates how many transfer frames may be in flight in each
//! direction. The incoming window is frame-counted: one unit per received
//! transfer, re-opened frame by frame as buffered payload is handed to the
//! application so a single large delivery cannot stall the session.

use log::{debug, trace, warn};

/// Policy converting a byte capacity into a frame-counted window.
///
/// The conversion and its floor are deliberately configurable; different
/// peers round differently and the engine must not hardwire either choice.
#[derive(Clone, Copy, Debug)]
pub struct WindowPolicy {
    /// Minimum window advertised regardless of capacity.
    pub frame_floor: u32,
}

impl Default for WindowPolicy {
    fn default() -> Self { Self { frame_floor: 1 } }
}

impl WindowPolicy {
    /// Frame window for `capacity_bytes` given `max_frame_size`.
    ///
    /// Rounds up so a capacity smaller than one frame still admits a frame.
    #[must_use]
    pub fn frames_for_capacity(&self, capacity_bytes: u64, max_frame_size: u32) -> u32 {
        let frame_size = u64::from(max_frame_size.max(1));
        let frames = capacity_bytes.div_ceil(frame_size);
        u32::try_from(frames)
            .unwrap_or(u32::MAX)
            .max(self.frame_floor)
    }
}

/// Session window update to surface on an outbound flow frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUpdate {
    pub next_incoming_id: u32,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
}

/// Per-session incoming/outgoing transfer window counters.
#[derive(Debug)]
pub struct SessionWindow {
    incoming_window: u32,
    max_incoming_window: u32,
    outgoing_window: u32,
    next_incoming_id: u32,
    next_outgoing_id: u32,
}

impl SessionWindow {
    /// Create a window from a configured byte capacity.
    #[must_use]
    pub fn new(
        incoming_capacity_bytes: u64,
        max_frame_size: u32,
        policy: WindowPolicy,
    ) -> Self {
        let incoming = policy.frames_for_capacity(incoming_capacity_bytes, max_frame_size);
        Self {
            incoming_window: incoming,
            max_incoming_window: incoming,
            outgoing_window: 0,
            next_incoming_id: 0,
            next_outgoing_id: 0,
        }
    }

    /// Remaining incoming window in frames.
    #[must_use]
    pub const fn incoming_window(&self) -> u32 { self.incoming_window }

    /// Remaining outgoing window in frames, as last reported by the peer.
    #[must_use]
    pub const fn outgoing_window(&self) -> u32 { self.outgoing_window }

    /// Next transfer id expected from the peer.
    #[must_use]
    pub const fn next_incoming_id(&self) -> u32 { self.next_incoming_id }

    /// Next transfer id this session will assign.
    #[must_use]
    pub const fn next_outgoing_id(&self) -> u32 { self.next_outgoing_id }

    /// Whether a further inbound transfer would overrun the window.
    #[must_use]
    pub const fn incoming_stalled(&self) -> bool { self.incoming_window == 0 }

    /// Account for one received transfer frame.
    ///
    /// The window never goes negative; a peer that overruns it is logged and
    /// clamped rather than crashing the session task.
    pub fn on_transfer_received(&mut self) {
        if self.incoming_window == 0 {
            warn!(
                "peer overran incoming window: next_incoming_id={}",
                self.next_incoming_id
            );
        }
        self.incoming_window = self.incoming_window.saturating_sub(1);
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        trace!(
            "transfer received: incoming_window={}, next_incoming_id={}",
            self.incoming_window, self.next_incoming_id
        );
    }

    /// Account for one emitted transfer frame.
    pub fn on_transfer_sent(&mut self) {
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.outgoing_window = self.outgoing_window.saturating_sub(1);
    }

    /// Whether the peer currently admits another outbound transfer.
    #[must_use]
    pub const fn can_send(&self) -> bool { self.outgoing_window > 0 }

    /// Apply the session-level fields of an inbound flow frame.
    pub fn on_remote_flow(&mut self, incoming_window: u32, next_incoming_id: Option<u32>) {
        // remote-incoming-window bounds our sends; re-derive the usable
        // outgoing window from the peer's view of our transfer ids.
        self.outgoing_window = match next_incoming_id {
            Some(id) => {
                let consumed = self.next_outgoing_id.wrapping_sub(id);
                incoming_window.saturating_sub(consumed)
            }
            None => incoming_window,
        };
        trace!("remote flow: outgoing_window={}", self.outgoing_window);
    }

    /// Account for `frames` freed by a reader, whether consumed or
    /// discarded unread.
    ///
    /// Each freed transfer frame re-opens one window unit; a delivery
    /// closed with unread frames must free them all before the final
    /// flow/disposition, otherwise the session stays short for its
    /// remaining lifetime. Returns an update when the window moved so the
    /// caller can emit a flow.
    pub fn on_frames_freed(&mut self, frames: u32) -> Option<WindowUpdate> {
        self.reopen(frames)
    }

    fn reopen(&mut self, units: u32) -> Option<WindowUpdate> {
        let reopened = self
            .incoming_window
            .saturating_add(units)
            .min(self.max_incoming_window);
        if reopened == self.incoming_window {
            return None;
        }
        self.incoming_window = reopened;
        debug!("incoming window reopened: incoming_window={reopened}");
        Some(self.update())
    }

    /// Snapshot of the current window counters.
    #[must_use]
    pub const fn update(&self) -> WindowUpdate {
        WindowUpdate {
            next_incoming_id: self.next_incoming_id,
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionWindow, WindowPolicy};

    #[test]
    fn capacity_rounds_up_with_frame_floor() {
        let policy = WindowPolicy::default();
        assert_eq!(policy.frames_for_capacity(0, 1024), 1);
        assert_eq!(policy.frames_for_capacity(1, 1024), 1);
        assert_eq!(policy.frames_for_capacity(1024, 1024), 1);
        assert_eq!(policy.frames_for_capacity(1025, 1024), 2);
        assert_eq!(policy.frames_for_capacity(10 * 1024, 1024), 10);
    }

    #[test]
    fn transfers_shrink_window_until_stalled() {
        let mut window = SessionWindow::new(2048, 1024, WindowPolicy::default());
        assert_eq!(window.incoming_window(), 2);
        window.on_transfer_received();
        window.on_transfer_received();
        assert!(window.incoming_stalled());
        assert_eq!(window.next_incoming_id(), 2);

        // A misbehaving peer does not underflow the counter.
        window.on_transfer_received();
        assert_eq!(window.incoming_window(), 0);
    }

    #[test]
    fn freed_frames_reopen_window_incrementally() {
        let mut window = SessionWindow::new(4096, 1024, WindowPolicy::default());
        for _ in 0..4 {
            window.on_transfer_received();
        }
        assert!(window.incoming_stalled());

        let update = window.on_frames_freed(1).expect("one unit reopened");
        assert_eq!(update.incoming_window, 1);
        let update = window.on_frames_freed(3).expect("three units reopened");
        assert_eq!(update.incoming_window, 4);
    }

    // A freed frame opens a full unit no matter how small its payload was,
    // so short frames cannot erode the window over time.
    #[test]
    fn every_freed_frame_restores_a_full_unit() {
        let mut window = SessionWindow::new(16, 4, WindowPolicy::default());
        assert_eq!(window.incoming_window(), 4);
        for _ in 0..4 {
            window.on_transfer_received();
            window.on_frames_freed(1);
        }
        assert_eq!(window.incoming_window(), 4);
    }

    #[test]
    fn reopen_never_exceeds_configured_maximum() {
        let mut window = SessionWindow::new(2048, 1024, WindowPolicy::default());
        window.on_transfer_received();
        assert!(window.on_frames_freed(64).is_some());
        assert_eq!(window.incoming_window(), 2);
        assert!(window.on_frames_freed(1).is_none());
    }

    #[test]
    fn remote_flow_tracks_outgoing_window() {
        let mut window = SessionWindow::new(1024, 1024, WindowPolicy::default());
        assert!(!window.can_send());
        window.on_remote_flow(5, Some(0));
        assert!(window.can_send());
        window.on_transfer_sent();
        window.on_transfer_sent();
        assert_eq!(window.outgoing_window(), 3);
        // Peer refreshes its view after seeing one of our transfers.
        window.on_remote_flow(5, Some(1));
        assert_eq!(window.outgoing_window(), 4);
    }
}
