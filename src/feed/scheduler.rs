//! Single-flight coalescing of refresh triggers.
//!
//! Three sources ask for a background refresh: the user, the polling
//! interval, and the change reconciler. At most one refresh is outstanding
//! (debounce pending or fetch in flight); triggers arriving meanwhile are
//! dropped, and the first trigger after completion schedules exactly one more.

use std::time::Duration;
use tokio::time::Instant;

/// What asked for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Interval,
    Change,
}

/// Scheduler verdict for one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Issue the refresh now.
    FireNow,
    /// A debounced refresh is due at this instant.
    FireAt(Instant),
    /// Dropped: a refresh is already pending or in flight.
    Coalesced,
}

#[derive(Debug)]
pub struct RefreshScheduler {
    debounce: Duration,
    pending_until: Option<Instant>,
    /// Epoch of the refresh fetch currently in flight.
    in_flight: Option<u64>,
}

impl RefreshScheduler {
    /// `debounce` delays change-driven refreshes so a burst of notifications
    /// collapses into one fetch. Zero fires them immediately.
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending_until: None,
            in_flight: None,
        }
    }

    pub fn request(&mut self, trigger: Trigger, now: Instant) -> Decision {
        if self.in_flight.is_some() {
            tracing::debug!(?trigger, "Refresh already in flight, coalescing trigger");
            return Decision::Coalesced;
        }

        if self.pending_until.is_some() {
            // A user asking explicitly does not wait out the debounce; the
            // pending refresh is promoted instead of adding a second one.
            if trigger == Trigger::Manual {
                self.pending_until = None;
                return Decision::FireNow;
            }
            tracing::debug!(?trigger, "Refresh already pending, coalescing trigger");
            return Decision::Coalesced;
        }

        match trigger {
            Trigger::Change if !self.debounce.is_zero() => {
                let at = now + self.debounce;
                self.pending_until = Some(at);
                Decision::FireAt(at)
            }
            _ => Decision::FireNow,
        }
    }

    /// Consumes a pending debounced refresh if it is due.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.pending_until {
            Some(at) if at <= now => {
                self.pending_until = None;
                true
            }
            _ => false,
        }
    }

    /// Instant of the pending debounced refresh, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_until
    }

    /// Records that the refresh fetch tagged `epoch` was issued.
    pub fn started(&mut self, epoch: u64) {
        self.in_flight = Some(epoch);
    }

    /// Records completion of fetch `epoch`. Returns false if it was not the
    /// tracked refresh (superseded or unrelated).
    pub fn finished(&mut self, epoch: u64) -> bool {
        if self.in_flight == Some(epoch) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Drops any pending or tracked refresh. Used when the view changes; the
    /// state machine discards the abandoned fetch's result by epoch.
    pub fn cancel(&mut self) {
        self.pending_until = None;
        self.in_flight = None;
    }

    pub fn is_idle(&self) -> bool {
        self.pending_until.is_none() && self.in_flight.is_none()
    }
}
