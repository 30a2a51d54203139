//! The reconnect submachine: delay computation, attempt gating, and
//! subscription-restoration bookkeeping, kept separate from
//! [`super::ConnectionManager`] so it composes rather than entangles (spec
//! §4.6 "separate, composable").

use std::time::Duration;

use rand::Rng;

use crate::{
    error::ReconnectConfigError,
    guard::guard,
    value::Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectState {
    Disconnected,
    Reconnecting,
    Connected,
    Failed,
    WaitingForNetwork,
}

/// Which formula [`ReconnectConfig::capped_delay_ms`] uses to grow the delay
/// between attempts (spec §6 "Configuration surface", `reconnectBackoff`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    /// `initial · attempt`.
    Linear,
    /// `initial · multiplier^(attempt-1)`.
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 means uncapped.
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    /// In `[0, 1]`; fraction of `capped` the symmetric jitter window spans.
    pub jitter: f64,
    pub backoff_mode: BackoffMode,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            backoff_multiplier: 2.0,
            jitter: 0.1,
            backoff_mode: BackoffMode::Exponential,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(self) -> Result<Self, ReconnectConfigError> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ReconnectConfigError::MaxLessThanInitial);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ReconnectConfigError::BadMultiplier);
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ReconnectConfigError::BadJitter);
        }
        Ok(self)
    }

    /// `capped = min(initial · multiplier^(n-1), maxDelay)` for 1-indexed
    /// attempt `n` in [`BackoffMode::Exponential`] mode, or
    /// `min(initial · n, maxDelay)` in [`BackoffMode::Linear`] mode (spec
    /// §4.6 "Delay formula", invariant 7, scenario S6).
    pub fn capped_delay_ms(&self, attempt: u32) -> u64 {
        let base = match self.backoff_mode {
            BackoffMode::Exponential => self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1),
            BackoffMode::Linear => self.initial_delay_ms as f64 * attempt as f64,
        };
        base.min(self.max_delay_ms as f64).round() as u64
    }

    /// Final delay: `capped` plus a uniform sample from `±jitter · capped`.
    /// Jitter is skipped entirely (rather than sampled with a zero-width
    /// range, which would still call into the RNG) when `jitter == 0`, so
    /// S6's exact-bound scenario needs no RNG determinism assumptions.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay_ms(attempt) as f64;
        if self.jitter == 0.0 {
            return Duration::from_millis(capped as u64);
        }
        let window = self.jitter * capped;
        let sample = rand::rng().random_range(-window..=window);
        Duration::from_millis((capped + sample).max(0.0).round() as u64)
    }
}

/// `is_online() -> bool`, pushed explicitly via
/// [`ReconnectManager::set_network_state`] rather than polled (spec §4.6,
/// `setNetworkState(true)`).
pub trait NetworkDetector: Send {
    fn is_online(&self) -> bool;
}

type ReconnectedHook = Box<dyn Fn() + Send + Sync>;
type DisconnectedHook = Box<dyn Fn() + Send + Sync>;
type MaxAttemptsHook = Box<dyn Fn() + Send + Sync>;

/// A tracked subscription, replayed on reconnect via a user-supplied
/// callback (spec §4.6 "subscription restoration").
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSubscription {
    pub id: u64,
    pub query_path: String,
    pub args: crate::value::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectStatus {
    pub state: ReconnectState,
    pub attempt: u32,
    /// `None` when uncapped (`max_attempts == 0`).
    pub remaining_attempts: Option<u32>,
    pub ms_until_next_attempt: Option<u64>,
}

pub struct ReconnectManager {
    config: ReconnectConfig,
    state: ReconnectState,
    attempt: u32,
    scheduled_at: Option<Timestamp>,
    scheduled_delay_ms: Option<u64>,
    last_connected_at: Option<Timestamp>,
    last_disconnected_at: Option<Timestamp>,
    last_error: Option<String>,
    online: bool,
    disposed: bool,
    tracked: Vec<TrackedSubscription>,
    on_reconnected: Vec<ReconnectedHook>,
    on_disconnected: Vec<DisconnectedHook>,
    on_max_attempts_reached: Vec<MaxAttemptsHook>,
}

/// What the caller (the worker task) should do after calling
/// [`ReconnectManager::schedule`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleOutcome {
    /// Arm a timer for this many milliseconds.
    Scheduled(u64),
    /// A timer is already armed; nothing to do.
    AlreadyScheduled,
    Refused,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Disconnected,
            attempt: 0,
            scheduled_at: None,
            scheduled_delay_ms: None,
            last_connected_at: None,
            last_disconnected_at: None,
            last_error: None,
            online: true,
            disposed: false,
            tracked: Vec::new(),
            on_reconnected: Vec::new(),
            on_disconnected: Vec::new(),
            on_max_attempts_reached: Vec::new(),
        }
    }

    pub fn on_reconnected(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_reconnected.push(Box::new(hook));
    }

    pub fn on_disconnected(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_disconnected.push(Box::new(hook));
    }

    pub fn on_max_attempts_reached(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_max_attempts_reached.push(Box::new(hook));
    }

    pub fn track(&mut self, subscription: TrackedSubscription) {
        self.tracked.push(subscription);
    }

    pub fn untrack(&mut self, id: u64) {
        self.tracked.retain(|s| s.id != id);
    }

    pub fn tracked(&self) -> &[TrackedSubscription] {
        &self.tracked
    }

    /// Invariant 8: refuses to schedule when connected, already scheduled,
    /// offline, disposed, or when attempts are exhausted.
    pub fn schedule(&mut self, now: Timestamp) -> ScheduleOutcome {
        if self.disposed || self.state == ReconnectState::Connected {
            return ScheduleOutcome::Refused;
        }
        if self.scheduled_delay_ms.is_some() {
            return ScheduleOutcome::AlreadyScheduled;
        }
        if !self.online {
            self.state = ReconnectState::WaitingForNetwork;
            return ScheduleOutcome::Refused;
        }
        if self.config.max_attempts != 0 && self.attempt >= self.config.max_attempts {
            self.state = ReconnectState::Failed;
            for hook in &self.on_max_attempts_reached {
                guard(|| hook());
            }
            return ScheduleOutcome::Refused;
        }

        self.attempt += 1;
        let delay = self.config.delay_for_attempt(self.attempt).as_millis() as u64;
        self.state = ReconnectState::Reconnecting;
        self.scheduled_at = Some(now);
        self.scheduled_delay_ms = Some(delay);
        ScheduleOutcome::Scheduled(delay)
    }

    /// Cancels the timer without forcing a state change, resets counters
    /// and error, records the connected-at timestamp, and transitions to
    /// Connected. Fires `on_reconnected` (and returns the tracked set to
    /// replay) iff the prior state was Reconnecting.
    pub fn mark_connected(&mut self, now: Timestamp) -> Option<Vec<TrackedSubscription>> {
        let was_reconnecting = self.state == ReconnectState::Reconnecting;
        self.scheduled_at = None;
        self.scheduled_delay_ms = None;
        self.attempt = 0;
        self.last_error = None;
        self.last_connected_at = Some(now);
        self.state = ReconnectState::Connected;

        if was_reconnecting {
            for hook in &self.on_reconnected {
                guard(|| hook());
            }
            Some(self.tracked.clone())
        } else {
            None
        }
    }

    pub fn mark_disconnected(&mut self, now: Timestamp, error: Option<String>) {
        if self.state == ReconnectState::Disconnected {
            return;
        }
        self.last_disconnected_at = Some(now);
        self.last_error = error;
        self.state = ReconnectState::Disconnected;
        for hook in &self.on_disconnected {
            guard(|| hook());
        }
    }

    pub fn set_network_state(&mut self, online: bool) {
        self.online = online;
        if online && self.state == ReconnectState::WaitingForNetwork {
            self.state = ReconnectState::Disconnected;
        }
    }

    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
        if self.state == ReconnectState::Failed {
            self.state = ReconnectState::Disconnected;
        }
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.scheduled_at = None;
        self.scheduled_delay_ms = None;
        self.tracked.clear();
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn status(&self, now: Timestamp) -> ReconnectStatus {
        let ms_until_next_attempt = match (self.scheduled_at, self.scheduled_delay_ms) {
            (Some(at), Some(delay)) => {
                let elapsed = (now - at).max(0) as u64;
                Some(delay.saturating_sub(elapsed))
            },
            _ => None,
        };
        ReconnectStatus {
            state: self.state,
            attempt: self.attempt,
            remaining_attempts: (self.config.max_attempts != 0)
                .then(|| self.config.max_attempts.saturating_sub(self.attempt)),
            ms_until_next_attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn s6_reconnect_delay_bounds() {
        let config = ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 0,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            backoff_mode: BackoffMode::Exponential,
        }
        .validate()
        .unwrap();
        let expected = [1000, 2000, 4000, 8000, 16000, 30000];
        for (attempt, expected_delay) in (1..=6).zip(expected) {
            assert_eq!(config.capped_delay_ms(attempt), expected_delay);
            assert_eq!(config.delay_for_attempt(attempt).as_millis() as u64, expected_delay);
        }
    }

    #[test]
    fn invariant_7_delay_within_jitter_bounds() {
        let config = ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 0,
            backoff_multiplier: 2.0,
            jitter: 0.2,
            backoff_mode: BackoffMode::Exponential,
        }
        .validate()
        .unwrap();
        for attempt in 1..=6 {
            let capped = config.capped_delay_ms(attempt) as f64;
            let low = capped * 0.8;
            let high = capped * 1.2;
            for _ in 0..20 {
                let delay = config.delay_for_attempt(attempt).as_millis() as f64;
                assert!(delay >= low - 1.0 && delay <= high + 1.0, "{delay} not in [{low},{high}]");
            }
        }
    }

    #[test]
    fn linear_backoff_grows_by_a_constant_step() {
        let config = ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 0,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            backoff_mode: BackoffMode::Linear,
        }
        .validate()
        .unwrap();
        let expected = [1000, 2000, 3000, 4000, 5000, 6000];
        for (attempt, expected_delay) in (1..=6).zip(expected) {
            assert_eq!(config.capped_delay_ms(attempt), expected_delay);
        }
    }

    #[test]
    fn invariant_8_refuses_when_connected() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.mark_connected(0);
        assert_eq!(manager.schedule(0), ScheduleOutcome::Refused);
    }

    #[test]
    fn invariant_8_refuses_when_already_scheduled() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.mark_disconnected(0, None);
        assert!(matches!(manager.schedule(0), ScheduleOutcome::Scheduled(_)));
        assert_eq!(manager.schedule(0), ScheduleOutcome::AlreadyScheduled);
    }

    #[test]
    fn invariant_8_refuses_when_offline() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.mark_disconnected(0, None);
        manager.set_network_state(false);
        assert_eq!(manager.schedule(0), ScheduleOutcome::Refused);
        assert_eq!(manager.state(), ReconnectState::WaitingForNetwork);
    }

    #[test]
    fn invariant_8_refuses_when_disposed() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.mark_disconnected(0, None);
        manager.dispose();
        assert_eq!(manager.schedule(0), ScheduleOutcome::Refused);
    }

    #[test]
    fn invariant_8_failed_after_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: 2,
            ..ReconnectConfig::default()
        });
        manager.mark_disconnected(0, None);
        assert!(matches!(manager.schedule(0), ScheduleOutcome::Scheduled(_)));
        manager.mark_disconnected(1, None);
        assert!(matches!(manager.schedule(1), ScheduleOutcome::Scheduled(_)));
        manager.mark_disconnected(2, None);
        assert_eq!(manager.schedule(2), ScheduleOutcome::Refused);
        assert_eq!(manager.state(), ReconnectState::Failed);
    }

    #[test]
    fn failed_requires_explicit_reset_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: 1,
            ..ReconnectConfig::default()
        });
        manager.mark_disconnected(0, None);
        manager.schedule(0);
        manager.mark_disconnected(1, None);
        manager.schedule(1);
        assert_eq!(manager.state(), ReconnectState::Failed);
        manager.reset_attempts();
        assert_eq!(manager.state(), ReconnectState::Disconnected);
        assert!(matches!(manager.schedule(2), ScheduleOutcome::Scheduled(_)));
    }

    #[test]
    fn mark_connected_from_reconnecting_fires_hook_and_returns_tracked() {
        use std::sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        };
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.track(TrackedSubscription {
            id: 1,
            query_path: "messages:list".to_string(),
            args: crate::value::Value::Null,
        });
        manager.mark_disconnected(0, None);
        manager.schedule(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        manager.on_reconnected(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let restored = manager.mark_connected(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(restored.map(|r| r.len()), Some(1));
    }

    #[test]
    fn mark_connected_from_fresh_state_does_not_restore() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        assert_eq!(manager.mark_connected(0), None);
    }
}
