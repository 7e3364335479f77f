//! Turn-taking flag and reconnection state machine of a session.

use std::time::Duration;
use tokio::sync::watch;

use crate::config::SessionConfig;

// ======================== Turn state ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Microphone audio flows to the service.
    Active,
    /// The service finished its response; the send loop pauses briefly.
    TurnComplete,
}

/// Value carried by the turn flag. `completed_turns` only grows, so a reader
/// that observes the flag late still sees that a turn completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStatus {
    pub state: TurnState,
    pub completed_turns: u64,
}

impl Default for TurnStatus {
    fn default() -> Self {
        Self {
            state: TurnState::Active,
            completed_turns: 0,
        }
    }
}

/// Write side of the turn flag, owned by the receive loop.
///
/// Transitions are `Active -> TurnComplete -> Active`; a second
/// `TurnComplete` while already complete is ignored.
#[derive(Debug)]
pub struct TurnTracker {
    tx: watch::Sender<TurnStatus>,
}

impl TurnTracker {
    pub fn new() -> (Self, watch::Receiver<TurnStatus>) {
        let (tx, rx) = watch::channel(TurnStatus::default());
        (Self { tx }, rx)
    }

    /// Returns `false` when the turn was already complete.
    pub fn complete_turn(&self) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state == TurnState::TurnComplete {
                return false;
            }
            status.state = TurnState::TurnComplete;
            status.completed_turns += 1;
            true
        })
    }

    /// Back to `Active` when a new turn starts. Returns `false` if already active.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state == TurnState::Active {
                return false;
            }
            status.state = TurnState::Active;
            true
        })
    }
}

// ======================== Reconnection ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// `attempt` is 0 for the first connection, n for the n-th reconnect.
    Connecting { attempt: u32 },
    Active,
    BackingOff { attempt: u32, delay: Duration },
    Failed,
}

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Reconnect attempts allowed after consecutive failures (0 = never retry)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before the `attempt`-th reconnect (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            max_attempts: if cfg.auto_reconnect {
                cfg.max_reconnect_attempts
            } else {
                0
            },
            initial_delay: Duration::from_millis(cfg.reconnect_delay_ms),
            factor: cfg.reconnect_backoff_factor,
            max_delay: Duration::from_millis(cfg.max_reconnect_delay_ms),
        }
    }
}

/// `Disconnected -> Connecting -> Active -> BackingOff -> Connecting ... -> Failed`
///
/// The failure count resets once a connection is established, so the budget
/// bounds consecutive failed attempts.
#[derive(Debug)]
pub struct Reconnector {
    policy: RetryPolicy,
    state: LinkState,
    failures: u32,
}

impl Reconnector {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Disconnected,
            failures: 0,
        }
    }

    /// Consecutive failures since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn begin_connect(&mut self) -> LinkState {
        match self.state {
            LinkState::Disconnected | LinkState::BackingOff { .. } => {
                self.state = LinkState::Connecting {
                    attempt: self.failures,
                };
            }
            other => tracing::warn!("begin_connect ignored in state {:?}", other),
        }
        self.state
    }

    pub fn connected(&mut self) -> LinkState {
        match self.state {
            LinkState::Connecting { .. } => {
                self.state = LinkState::Active;
                self.failures = 0;
            }
            other => tracing::warn!("connected ignored in state {:?}", other),
        }
        self.state
    }

    /// Record a failed connect or a dropped connection.
    pub fn failed(&mut self) -> LinkState {
        match self.state {
            LinkState::Connecting { .. } | LinkState::Active => {
                self.failures += 1;
                self.state = if self.failures > self.policy.max_attempts {
                    LinkState::Failed
                } else {
                    LinkState::BackingOff {
                        attempt: self.failures,
                        delay: self.policy.delay_for(self.failures),
                    }
                };
            }
            other => tracing::warn!("failure ignored in state {:?}", other),
        }
        self.state
    }

    /// Clean teardown, e.g. on user interrupt.
    pub fn disconnect(&mut self) -> LinkState {
        if self.state != LinkState::Failed {
            self.state = LinkState::Disconnected;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(5),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(2), Duration::from_secs(10));
        assert_eq!(p.delay_for(3), Duration::from_secs(20));
        assert_eq!(p.delay_for(4), Duration::from_secs(30));
        assert_eq!(p.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn budget_exhaustion_fails() {
        let mut r = Reconnector::new(policy(3));
        assert_eq!(r.begin_connect(), LinkState::Connecting { attempt: 0 });

        for attempt in 1..=3 {
            assert_eq!(
                r.failed(),
                LinkState::BackingOff {
                    attempt,
                    delay: policy(3).delay_for(attempt)
                }
            );
            assert_eq!(r.begin_connect(), LinkState::Connecting { attempt });
        }
        assert_eq!(r.failed(), LinkState::Failed);
        assert_eq!(r.failures(), 4);

        // Nothing brings a failed session back.
        assert_eq!(r.begin_connect(), LinkState::Failed);
        assert_eq!(r.disconnect(), LinkState::Failed);
    }

    #[test]
    fn successful_connect_resets_the_budget() {
        let mut r = Reconnector::new(policy(1));
        r.begin_connect();
        r.connected();
        assert!(matches!(r.failed(), LinkState::BackingOff { attempt: 1, .. }));
        r.begin_connect();
        assert_eq!(r.connected(), LinkState::Active);
        assert_eq!(r.failures(), 0);
        assert!(matches!(r.failed(), LinkState::BackingOff { attempt: 1, .. }));
    }

    #[test]
    fn auto_reconnect_off_means_no_retries() {
        let cfg = SessionConfig {
            auto_reconnect: false,
            ..SessionConfig::default()
        };
        let mut r = Reconnector::new(RetryPolicy::from(&cfg));
        r.begin_connect();
        assert_eq!(r.failed(), LinkState::Failed);
    }

    #[test]
    fn turn_flag_has_no_self_transition() {
        let (tracker, mut rx) = TurnTracker::new();
        assert_eq!(rx.borrow_and_update().state, TurnState::Active);

        assert!(!tracker.resume());
        assert!(tracker.complete_turn());
        assert!(!tracker.complete_turn());
        assert_eq!(rx.borrow().completed_turns, 1);

        assert!(tracker.resume());
        assert!(tracker.complete_turn());
        let seen = *rx.borrow_and_update();
        assert_eq!(seen.state, TurnState::TurnComplete);
        assert_eq!(seen.completed_turns, 2);
    }

    #[tokio::test]
    async fn late_reader_still_sees_the_completed_turn() {
        let (tracker, mut rx) = TurnTracker::new();
        tracker.complete_turn();
        tracker.resume();

        rx.changed().await.unwrap();
        let status = *rx.borrow_and_update();
        assert_eq!(status.state, TurnState::Active);
        assert_eq!(status.completed_turns, 1);
    }
}
