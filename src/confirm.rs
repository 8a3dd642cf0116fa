//! Consecutive-frame confirmation with a cooldown window.
//!
//! Turns a stream of per-frame positive/negative signals into a rate-limited
//! confirmation signal:
//! - every positive increments the run, every negative resets it to zero
//! - a confirmation fires when the run reaches `required` and the last
//!   confirmation is at least `cooldown` old
//! - after a confirmation the run restarts from zero
//!
//! During cooldown positives keep accumulating so the next event can confirm
//! as soon as the window elapses.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationPhase {
    Idle,
    Verifying,
    Cooldown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Negative signal; any run in progress was discarded.
    Reset,
    /// Positive signal that did not confirm. Tentative, for observers only.
    Progress { count: u32, required: u32 },
    /// Positive signal that completed a run outside the cooldown window.
    Confirmed { required: u32 },
}

#[derive(Clone, Debug)]
pub struct ConfirmationState {
    required: u32,
    cooldown: Duration,
    consecutive: u32,
    last_confirmed_at: Option<Instant>,
}

impl ConfirmationState {
    /// `required` is clamped to at least 1.
    pub fn new(required: u32, cooldown: Duration) -> Self {
        Self {
            required: required.max(1),
            cooldown,
            consecutive: 0,
            last_confirmed_at: None,
        }
    }

    /// Feed one sampled frame's signal observed at `now`.
    ///
    /// Signals must be fed in capture order.
    pub fn observe(&mut self, positive: bool, now: Instant) -> ConfirmationOutcome {
        if !positive {
            self.consecutive = 0;
            return ConfirmationOutcome::Reset;
        }

        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive >= self.required && !self.in_cooldown(now) {
            self.consecutive = 0;
            self.last_confirmed_at = Some(now);
            return ConfirmationOutcome::Confirmed {
                required: self.required,
            };
        }

        ConfirmationOutcome::Progress {
            count: self.consecutive,
            required: self.required,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_confirmed_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown)
    }

    pub fn phase(&self, now: Instant) -> ConfirmationPhase {
        if self.in_cooldown(now) {
            ConfirmationPhase::Cooldown
        } else if self.consecutive > 0 {
            ConfirmationPhase::Verifying
        } else {
            ConfirmationPhase::Idle
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn last_confirmed_at(&self) -> Option<Instant> {
        self.last_confirmed_at
    }
}

/// Verification progress as a whole percentage, capped at 100.
pub fn progress_percent(count: u32, required: u32) -> u8 {
    if required == 0 {
        return 100;
    }
    let pct = (u64::from(count) * 100) / u64::from(required);
    pct.min(100) as u8
}
