//! Reconnection state machine shared by both transports.
//!
//! The WebSocket feed and the MQTT broker each run one [`Reconnect`]
//! instance, differing only in [`RetryPolicy`].  Transitions are driven by
//! discrete events so the whole thing is testable without a network:
//!
//! ```text
//! Connecting ──[Opened]──▶ Open ──[Closed/Errored]──▶ Retrying(1..max)
//!      ▲                                                   │
//!      └──────────[delay elapsed / Wake]────────────────────┘
//!                                                           │
//!                       GivenUp ◀──[attempt > max]──────────┘
//!                          │
//!                          └──[Wake]──▶ Connecting (counter reset)
//! ```

use std::time::Duration;

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Attempt in progress (also the initial state).
    Connecting,
    Open,
    /// Waiting out the backoff delay before attempt `attempt + 1`.
    Retrying { attempt: u32 },
    /// Max consecutive failures reached; only a `Wake` restarts us.
    GivenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Opened,
    Closed,
    Errored,
    /// Manual retry, visibility change, or the periodic poll.  Resets the
    /// attempt counter — deliberate redundancy to recover from silent
    /// failures the close handler never saw.
    Wake,
}

/// What the transport task should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    None,
    /// Tear down any live connection and dial again, after the delay.
    Reconnect { delay: Duration },
    /// Surface the persistent connection-error notice and park.
    GiveUp,
}

// ---------------------------------------------------------------------------
// Retry policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    /// Same delay every attempt (WebSocket feed).
    Fixed { delay: Duration },
    /// Delay doubles per attempt up to a ceiling (MQTT broker).
    Doubling { base: Duration, cap: Duration },
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed { delay } => delay,
            RetryPolicy::Doubling { base, cap } => {
                let exp = attempt.saturating_sub(1).min(16);
                let d = base.saturating_mul(1u32 << exp);
                d.min(cap)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Reconnect {
    state: ConnState,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl Reconnect {
    pub fn new(policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            state: ConnState::Connecting,
            policy,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Apply one event and return the action the transport task must take.
    pub fn on_event(&mut self, event: ConnEvent) -> ConnAction {
        match (self.state, event) {
            // Successful open resets the counter, wherever we were.
            (_, ConnEvent::Opened) => {
                self.state = ConnState::Open;
                ConnAction::None
            }

            // Wake only matters when we are not open: it resets the counter
            // and forces an immediate attempt, independent of any backoff.
            (ConnState::Open, ConnEvent::Wake) => ConnAction::None,
            (_, ConnEvent::Wake) => {
                self.state = ConnState::Connecting;
                ConnAction::Reconnect {
                    delay: Duration::ZERO,
                }
            }

            // Failure while parked changes nothing.
            (ConnState::GivenUp, _) => ConnAction::None,

            // Close or error from any live/connecting state schedules the
            // next attempt or gives up.
            (state, ConnEvent::Closed | ConnEvent::Errored) => {
                let attempt = match state {
                    ConnState::Retrying { attempt } => attempt + 1,
                    _ => 1,
                };
                if attempt > self.max_attempts {
                    self.state = ConnState::GivenUp;
                    ConnAction::GiveUp
                } else {
                    self.state = ConnState::Retrying { attempt };
                    ConnAction::Reconnect {
                        delay: self.policy.delay(attempt),
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
