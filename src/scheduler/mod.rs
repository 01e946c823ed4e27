//! Adaptive navigation scheduler.
//!
//! Decides the minimum delay before the next navigation from three
//! inputs: the wall-clock context (night hours, weekends), the recent
//! traffic density (burst penalty), and a self-escalating emergency mode
//! entered after any reported failure. All of it is non-throwing
//! heuristics; the only suspension point is the cooperative sleep in
//! [`AdaptiveScheduler::wait`].

use crate::clock::Clock;
use crate::config::{SchedulerConfig, TimingPattern};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Bounded ordered sequence of navigation timestamps, oldest evicted
/// first.
#[derive(Debug, Clone)]
pub struct RequestHistory {
    events: VecDeque<DateTime<Utc>>,
    capacity: usize,
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a timestamp, evicting the oldest past capacity.
    pub fn record(&mut self, at: DateTime<Utc>) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(at);
    }

    /// Number of events within `window` before `now`.
    pub fn count_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.recent(now, window).count()
    }

    /// Events within `window` before `now`, oldest first.
    pub fn recent(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let cutoff =
            now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.events.iter().copied().filter(move |t| *t > cutoff)
    }

    /// Mean gap between consecutive events, in milliseconds.
    pub fn average_interval_ms(&self) -> Option<f64> {
        if self.events.len() < 2 {
            return None;
        }
        let total: i64 = self
            .events
            .iter()
            .zip(self.events.iter().skip(1))
            .map(|(a, b)| (*b - *a).num_milliseconds())
            .sum();
        Some(total as f64 / (self.events.len() - 1) as f64)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Scheduler operating mode. Emergency is a latch set by any reported
/// failure; it auto-clears once the expiry instant passes and is never
/// cleared by success alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    Normal,
    Emergency { expires_at: DateTime<Utc> },
}

struct State {
    history: RequestHistory,
    last_request_at: Option<DateTime<Utc>>,
    mode: Mode,
}

/// Point-in-time snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub emergency: bool,
    pub emergency_expires_at: Option<DateTime<Utc>>,
    pub active_session: bool,
    pub recorded_requests: usize,
    pub average_interval_ms: Option<f64>,
}

/// Adaptive rate limiter gating every navigation.
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    rng: Mutex<StdRng>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>, rng_seed: Option<u64>) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let history = RequestHistory::new(config.history_capacity);
        Self {
            config,
            clock,
            state: Mutex::new(State {
                history,
                last_request_at: None,
                mode: Mode::Normal,
            }),
            rng: Mutex::new(rng),
        }
    }

    /// Compute the delay to impose before the next navigation.
    pub fn next_interval(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        expire_emergency(&mut state.mode, now);
        let emergency = matches!(state.mode, Mode::Emergency { .. });

        let (pattern, name) = self.select_pattern(now, emergency, &state.history);
        let penalty = self.burst_penalty_at(now, &state.history);

        let jitter = {
            let mut rng = self.rng.lock().unwrap();
            let v = pattern.variance_ms as f64;
            rng.gen_range(-v..=v)
        };

        let raw = pattern.base_ms as f64 * (1.0 + penalty) + jitter;
        let floor = self.config.min_interval_ms as f64;
        let clamped = if emergency {
            raw.max(floor)
        } else {
            raw.max(floor).min(self.config.max_interval_ms as f64)
        };

        debug!(
            pattern = name,
            penalty,
            interval_ms = clamped as u64,
            "computed next interval"
        );
        Duration::from_millis(clamped as u64)
    }

    /// Record a navigation outcome.
    ///
    /// Success only appends to history. Any failure enters emergency
    /// mode and re-arms its expiry to a full duration from now, so the
    /// latch tracks the latest failure.
    pub fn record(&self, success: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.history.record(now);
        if !success {
            let expires_at = now
                + chrono::Duration::from_std(Duration::from_secs(
                    self.config.emergency_duration_secs,
                ))
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            state.mode = Mode::Emergency { expires_at };
            info!("entering emergency mode until {expires_at}");
        }
    }

    /// Suspend the caller until the computed interval since the last
    /// navigation has elapsed, then stamp the new navigation instant.
    pub async fn wait(&self) {
        let interval = self.next_interval();
        let remaining = {
            let state = self.state.lock().unwrap();
            match state.last_request_at {
                None => Duration::ZERO,
                Some(last) => {
                    let elapsed = (self.clock.now() - last).to_std().unwrap_or_default();
                    interval.saturating_sub(elapsed)
                }
            }
        };
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        self.state.lock().unwrap().last_request_at = Some(self.clock.now());
    }

    /// Force emergency mode for a duration.
    pub fn set_emergency(&self, duration: Duration) {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.state.lock().unwrap().mode = Mode::Emergency { expires_at };
        info!("emergency mode forced until {expires_at}");
    }

    /// Whether the emergency latch is currently set.
    pub fn is_emergency(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        expire_emergency(&mut state.mode, now);
        matches!(state.mode, Mode::Emergency { .. })
    }

    /// Whether recent traffic makes this an active session.
    pub fn is_active_session(&self) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        self.active_session_at(now, &state.history)
    }

    /// Burst penalty for the current history. 0 means no slowdown.
    pub fn burst_penalty(&self) -> f64 {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        self.burst_penalty_at(now, &state.history)
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        expire_emergency(&mut state.mode, now);
        SchedulerStatus {
            emergency: matches!(state.mode, Mode::Emergency { .. }),
            emergency_expires_at: match state.mode {
                Mode::Emergency { expires_at } => Some(expires_at),
                Mode::Normal => None,
            },
            active_session: self.active_session_at(now, &state.history),
            recorded_requests: state.history.len(),
            average_interval_ms: state.history.average_interval_ms(),
        }
    }

    fn active_session_at(&self, now: DateTime<Utc>, history: &RequestHistory) -> bool {
        history.count_within(
            now,
            Duration::from_secs(self.config.active_session_window_secs),
        ) > self.config.active_session_min_requests
    }

    /// Pattern priority: emergency > night > weekend > active session >
    /// idle.
    fn select_pattern(
        &self,
        now: DateTime<Utc>,
        emergency: bool,
        history: &RequestHistory,
    ) -> (TimingPattern, &'static str) {
        let patterns = &self.config.patterns;
        if emergency {
            return (patterns.emergency, "emergency");
        }
        let hour = now.hour();
        if hour < 6 || hour > 22 {
            return (patterns.night, "night");
        }
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return (patterns.weekend, "weekend");
        }
        if self.active_session_at(now, history) {
            return (patterns.active, "active");
        }
        (patterns.idle, "idle")
    }

    /// Sum of linearly decayed weights of requests inside the burst
    /// window, normalized by the threshold and capped.
    fn burst_penalty_at(&self, now: DateTime<Utc>, history: &RequestHistory) -> f64 {
        let window = Duration::from_secs(self.config.burst_window_secs);
        let recent: Vec<DateTime<Utc>> = history.recent(now, window).collect();
        if recent.len() <= self.config.burst_threshold {
            return 0.0;
        }
        let decay = self.config.decay_window_secs as f64;
        let sum: f64 = recent
            .iter()
            .map(|t| {
                let age = (now - *t).num_milliseconds() as f64 / 1000.0;
                (1.0 - age / decay).max(0.0)
            })
            .sum();
        (sum / self.config.burst_threshold as f64).min(self.config.max_penalty_multiplier)
    }
}

fn expire_emergency(mode: &mut Mode, now: DateTime<Utc>) {
    if let Mode::Emergency { expires_at } = *mode {
        if now >= expires_at {
            info!("emergency mode cleared");
            *mode = Mode::Normal;
        }
    }
}
