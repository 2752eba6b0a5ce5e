//! Link credit tracking and replenishment policy.
//!
//! [`CreditTracker`] decides how much link credit to advertise and when to
//! top it back up. It is a pure state machine: operations mutate local
//! counters and return a [`FlowUpdate`] when the link engine should emit a
//! flow frame. All mutation happens on the session's processing task.

use log::{debug, trace};
use thiserror::Error;

/// Errors raised by credit operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CreditError {
    /// Manual credit cannot be added while a drain is outstanding.
    #[error("cannot add credit while a drain is in progress")]
    DrainInProgress,
    /// Manual credit cannot be added while a credit window manages the link.
    #[error("cannot add credit while a credit window is configured")]
    WindowManaged,
    /// A drain is already outstanding on this link.
    #[error("drain already in progress")]
    DrainAlreadyRequested,
}

/// Link-level flow state to be carried on an outbound flow frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowUpdate {
    pub link_credit: u32,
    pub delivery_count: u32,
    pub drain: bool,
}

/// Per-receiver credit state.
///
/// With `credit_window = Some(w)` the tracker replenishes automatically as
/// deliveries are consumed; manual [`add_credit`](Self::add_credit) is then
/// rejected. With `None` the application manages credit explicitly.
#[derive(Debug)]
pub struct CreditTracker {
    link_credit: u32,
    delivery_count: u32,
    drain_requested: bool,
    credit_window: Option<u32>,
}

impl CreditTracker {
    /// Create a tracker with manual credit management.
    #[must_use]
    pub const fn manual() -> Self {
        Self {
            link_credit: 0,
            delivery_count: 0,
            drain_requested: false,
            credit_window: None,
        }
    }

    /// Create a tracker that keeps `window` credits outstanding.
    ///
    /// Returns the tracker together with the initial flow update granting the
    /// full window.
    #[must_use]
    pub fn windowed(window: u32) -> (Self, FlowUpdate) {
        let mut tracker = Self {
            link_credit: window,
            delivery_count: 0,
            drain_requested: false,
            credit_window: Some(window),
        };
        let update = tracker.flow_update(false);
        (tracker, update)
    }

    /// Currently advertised link credit.
    #[must_use]
    pub const fn link_credit(&self) -> u32 { self.link_credit }

    /// Deliveries received on this link so far, as counted locally.
    #[must_use]
    pub const fn delivery_count(&self) -> u32 { self.delivery_count }

    /// Whether a drain request is outstanding.
    #[must_use]
    pub const fn drain_requested(&self) -> bool { self.drain_requested }

    /// Whether a credit window manages this link.
    #[must_use]
    pub const fn is_windowed(&self) -> bool { self.credit_window.is_some() }

    /// Grant `n` additional credits.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::DrainInProgress`] while a drain is outstanding
    /// and [`CreditError::WindowManaged`] when a credit window is configured;
    /// both orderings of those conditions fail identically.
    pub fn add_credit(&mut self, n: u32) -> Result<FlowUpdate, CreditError> {
        if self.drain_requested {
            return Err(CreditError::DrainInProgress);
        }
        if self.credit_window.is_some() {
            return Err(CreditError::WindowManaged);
        }
        self.link_credit = self.link_credit.saturating_add(n);
        debug!("credit granted: added={n}, link_credit={}", self.link_credit);
        Ok(self.flow_update(false))
    }

    /// Request that the sender use or forfeit all outstanding credit.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::DrainAlreadyRequested`] if a drain is already
    /// outstanding; no second flow frame is emitted.
    pub fn begin_drain(&mut self) -> Result<FlowUpdate, CreditError> {
        if self.drain_requested {
            return Err(CreditError::DrainAlreadyRequested);
        }
        self.drain_requested = true;
        debug!("drain requested: link_credit={}", self.link_credit);
        Ok(self.flow_update(true))
    }

    /// Observe the remote's response to a drain.
    ///
    /// The sender advances its delivery count to consume remaining credit
    /// and reports `link_credit = 0`. Returns `true` when the drain cycle is
    /// finished.
    pub fn on_drain_flow(&mut self, delivery_count: u32, link_credit: u32) -> bool {
        if !self.drain_requested || link_credit != 0 {
            return false;
        }
        self.delivery_count = delivery_count;
        self.link_credit = 0;
        self.drain_requested = false;
        debug!("drain complete: delivery_count={delivery_count}");
        true
    }

    /// Account for one received transfer frame opening a new delivery.
    pub fn on_transfer(&mut self) {
        self.link_credit = self.link_credit.saturating_sub(1);
        self.delivery_count = self.delivery_count.wrapping_add(1);
        trace!(
            "transfer consumed credit: link_credit={}, delivery_count={}",
            self.link_credit, self.delivery_count
        );
    }

    /// Account for a fully consumed delivery and apply the replenishment
    /// policy.
    ///
    /// With a credit window `w`, a replenishing flow is emitted only once
    /// outstanding credit drops to 70% of the window or below. The
    /// hysteresis avoids a flow frame per consumed delivery.
    pub fn on_delivery_consumed(&mut self, unconsumed: u32) -> Option<FlowUpdate> {
        let window = self.credit_window?;
        let outstanding = self.link_credit.saturating_add(unconsumed);
        if u64::from(outstanding) * 10 > u64::from(window) * 7 {
            return None;
        }
        self.top_up(window, unconsumed)
    }

    /// Account for an aborted delivery.
    ///
    /// The aborted transfer consumed a credit slot without producing usable
    /// content, so a windowed link tops up immediately regardless of the
    /// hysteresis threshold.
    pub fn on_delivery_aborted(&mut self, unconsumed: u32) -> Option<FlowUpdate> {
        let window = self.credit_window?;
        self.top_up(window, unconsumed)
    }

    /// Restore outstanding credit (advertised credit plus buffered
    /// deliveries) to the full window.
    fn top_up(&mut self, window: u32, unconsumed: u32) -> Option<FlowUpdate> {
        let target = window.saturating_sub(unconsumed);
        if self.drain_requested || self.link_credit >= target {
            return None;
        }
        self.link_credit = target;
        debug!("credit window replenished: link_credit={target}");
        Some(self.flow_update(false))
    }

    fn flow_update(&self, drain: bool) -> FlowUpdate {
        FlowUpdate {
            link_credit: self.link_credit,
            delivery_count: self.delivery_count,
            drain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CreditError, CreditTracker};

    #[test]
    fn manual_credit_accumulates() {
        let mut tracker = CreditTracker::manual();
        let update = tracker.add_credit(5).expect("credit granted");
        assert_eq!(update.link_credit, 5);
        let update = tracker.add_credit(3).expect("credit granted");
        assert_eq!(update.link_credit, 8);
        assert!(!update.drain);
    }

    #[test]
    fn add_credit_rejected_during_drain() {
        let mut tracker = CreditTracker::manual();
        tracker.add_credit(2).expect("credit granted");
        tracker.begin_drain().expect("drain accepted");
        assert_eq!(tracker.add_credit(1), Err(CreditError::DrainInProgress));
    }

    #[test]
    fn add_credit_rejected_when_windowed() {
        let (mut tracker, update) = CreditTracker::windowed(10);
        assert_eq!(update.link_credit, 10);
        assert_eq!(tracker.add_credit(1), Err(CreditError::WindowManaged));
    }

    #[test]
    fn second_drain_fails_fast() {
        let mut tracker = CreditTracker::manual();
        tracker.add_credit(4).expect("credit granted");
        let update = tracker.begin_drain().expect("drain accepted");
        assert!(update.drain);
        assert_eq!(update.link_credit, 4);
        assert_eq!(
            tracker.begin_drain(),
            Err(CreditError::DrainAlreadyRequested)
        );
    }

    #[test]
    fn drain_completes_on_zero_credit_flow() {
        let mut tracker = CreditTracker::manual();
        tracker.add_credit(4).expect("credit granted");
        tracker.begin_drain().expect("drain accepted");
        assert!(!tracker.on_drain_flow(2, 4));
        assert!(tracker.on_drain_flow(4, 0));
        assert!(!tracker.drain_requested());
        assert_eq!(tracker.link_credit(), 0);
    }

    #[test]
    fn window_hysteresis_replenishes_at_seventy_percent() {
        let (mut tracker, _) = CreditTracker::windowed(10);

        // Ten one-frame deliveries arrive up front.
        for _ in 0..10 {
            tracker.on_transfer();
        }
        assert_eq!(tracker.link_credit(), 0);

        // Consuming deliveries one at a time: flows fire only when
        // outstanding (credit + unconsumed) reaches 70% of the window.
        let mut flows = Vec::new();
        for consumed in 1..=10u32 {
            let unconsumed = 10 - consumed;
            flows.push(tracker.on_delivery_consumed(unconsumed).is_some());
        }
        assert_eq!(
            flows,
            vec![false, false, true, false, false, true, false, false, true, false]
        );
    }

    #[test]
    fn interleaved_arrival_replenishes_every_third_delivery() {
        let (mut tracker, _) = CreditTracker::windowed(10);

        let mut flows = Vec::new();
        for _ in 1..=10u32 {
            tracker.on_transfer();
            flows.push(tracker.on_delivery_consumed(0).is_some());
        }
        assert_eq!(
            flows,
            vec![false, false, true, false, false, true, false, false, true, false]
        );
    }

    #[test]
    fn aborted_delivery_forces_top_up() {
        let (mut tracker, _) = CreditTracker::windowed(4);
        tracker.on_transfer();
        assert_eq!(tracker.link_credit(), 3);
        let update = tracker.on_delivery_aborted(0).expect("flow forced");
        assert_eq!(update.link_credit, 4);
    }

    #[test]
    fn manual_tracker_never_replenishes() {
        let mut tracker = CreditTracker::manual();
        tracker.add_credit(10).expect("credit granted");
        for _ in 0..10 {
            tracker.on_transfer();
        }
        assert!(tracker.on_delivery_consumed(0).is_none());
        assert!(tracker.on_delivery_aborted(0).is_none());
    }
}
