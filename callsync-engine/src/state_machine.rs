//! Call status state machine
//!
//! Valid transitions follow `queued -> initiated -> ringing -> in-progress ->
//! {final}`. Final states are absorbing; finalized records freeze once the
//! cooldown has elapsed.

use callsync_common::{CallStatus, SyncState};
use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};

/// Status portion of a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallState {
    pub status: CallStatus,
    pub is_final: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
}

/// Outcome of [`StateMachine::validate_transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl TransitionCheck {
    fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// How invalid transitions are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    /// Live webhook processing: invalid transitions are errors
    Strict,
    /// Reconciliation: invalid transitions keep the current state
    Lenient,
}

#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    cooldown: Duration,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(Duration::hours(6))
    }
}

impl StateMachine {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_final(status: CallStatus) -> bool {
        status.is_final()
    }

    pub fn validate_transition(from: Option<CallStatus>, to: CallStatus) -> TransitionCheck {
        let Some(from) = from else {
            return TransitionCheck::valid();
        };

        if from == to {
            return TransitionCheck::valid();
        }

        if from.is_final() {
            return TransitionCheck::invalid("cannot leave a final state");
        }

        if to.rank() > from.rank() {
            TransitionCheck::valid()
        } else {
            TransitionCheck::invalid(format!("{} does not follow {}", to, from))
        }
    }

    /// True once a final record has been final for strictly longer than the cooldown
    pub fn should_freeze(&self, state: &CallState, now: DateTime<Utc>) -> bool {
        match (state.is_final, state.finalized_at) {
            (true, Some(finalized_at)) => now - finalized_at > self.cooldown,
            _ => false,
        }
    }

    /// Initial state for the first event seen for a call
    pub fn initial_state(&self, status: CallStatus, at: DateTime<Utc>, now: DateTime<Utc>) -> CallState {
        let is_final = status.is_final();
        let mut state = CallState {
            status,
            is_final,
            finalized_at: is_final.then_some(at),
            sync_state: SyncState::Active,
        };
        if self.should_freeze(&state, now) {
            state.sync_state = SyncState::Frozen;
        }
        state
    }

    /// Compute the state after `new_status` arrives at `at`
    ///
    /// `finalized_at` is stamped on the first transition into a final state
    /// and never overwritten. `sync_state` is recomputed against `now`.
    pub fn apply_transition(
        &self,
        current: &CallState,
        new_status: CallStatus,
        mode: TransitionMode,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CallState> {
        let check = Self::validate_transition(Some(current.status), new_status);
        if !check.valid {
            return match mode {
                TransitionMode::Strict => Err(Error::InvalidTransition {
                    from: current.status,
                    to: new_status,
                    reason: check.reason.unwrap_or_default(),
                }),
                TransitionMode::Lenient => {
                    tracing::debug!(
                        from = %current.status,
                        to = %new_status,
                        "Ignoring invalid transition"
                    );
                    Ok(*current)
                }
            };
        }

        let is_final = new_status.is_final();
        let finalized_at = match current.finalized_at {
            Some(existing) => Some(existing),
            None if is_final => Some(at),
            None => None,
        };

        let mut next = CallState {
            status: new_status,
            is_final,
            finalized_at,
            sync_state: current.sync_state,
        };
        if self.should_freeze(&next, now) {
            next.sync_state = SyncState::Frozen;
        }
        Ok(next)
    }
}
