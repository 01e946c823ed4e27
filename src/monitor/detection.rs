//! Detection incident monitor.
//!
//! Classifies navigation outcomes inside a rolling window and raises an
//! alert when incidents cross the configured threshold. Callbacks fire
//! exactly once per crossing; the latch re-arms once the window slides
//! back under the threshold.

use crate::clock::Clock;
use crate::config::DetectionConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// What a failed or suspicious navigation looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IncidentKind {
    Timeout,
    BlockPage,
    Challenge,
    RateLimit,
    Other,
}

/// Keyword heuristics over an error message, page title, or status
/// text. Returns `None` when nothing looks like a detection marker.
pub fn classify(text: &str) -> Option<IncidentKind> {
    let lower = text.to_lowercase();
    if ["captcha", "challenge", "verify you are human", "are you a robot"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Some(IncidentKind::Challenge);
    }
    if ["rate limit", "too many requests", "429"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Some(IncidentKind::RateLimit);
    }
    if ["access denied", "forbidden", "blocked", "unusual traffic", "403"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Some(IncidentKind::BlockPage);
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Some(IncidentKind::Timeout);
    }
    None
}

/// Alert severity. `Warning` fires at the alert threshold, `Critical`
/// at the configured multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// Payload delivered to registered alert callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionAlert {
    pub severity: Severity,
    pub incidents_in_window: usize,
    pub window_secs: u64,
    /// Details of the incident that tipped the threshold.
    pub details: String,
}

/// Rolling detection metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionStatus {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub incidents_total: u64,
    pub incidents_in_window: usize,
    pub alert_active: bool,
}

type AlertCallback = Box<dyn Fn(&DetectionAlert) + Send + Sync>;

struct State {
    events: VecDeque<(DateTime<Utc>, bool)>,
    total_requests: u64,
    successful_requests: u64,
    incidents_total: u64,
    warning_latched: bool,
    critical_latched: bool,
}

/// Pure observer of navigation outcomes.
pub struct DetectionMonitor {
    config: DetectionConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl DetectionMonitor {
    pub fn new(config: DetectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(State {
                events: VecDeque::new(),
                total_requests: 0,
                successful_requests: 0,
                incidents_total: 0,
                warning_latched: false,
                critical_latched: false,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback invoked on every threshold crossing.
    pub fn register_alert_callback(
        &self,
        callback: impl Fn(&DetectionAlert) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Count a navigation attempt entering the pipeline.
    pub fn record_attempt(&self) {
        self.state.lock().unwrap().total_requests += 1;
    }

    /// Record a navigation outcome and fire alerts on crossings.
    pub fn record(&self, success: bool, details: &str) {
        let now = self.clock.now();
        let mut alerts = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.events.push_back((now, success));
            prune(&mut state.events, now, self.config.window_secs);

            if success {
                state.successful_requests += 1;
            } else {
                state.incidents_total += 1;
                debug!("detection incident recorded: {details}");
            }

            let incidents = state.events.iter().filter(|(_, ok)| !ok).count();

            if incidents >= self.config.alert_threshold {
                if !state.warning_latched {
                    state.warning_latched = true;
                    alerts.push(DetectionAlert {
                        severity: Severity::Warning,
                        incidents_in_window: incidents,
                        window_secs: self.config.window_secs,
                        details: details.to_string(),
                    });
                }
            } else {
                state.warning_latched = false;
            }

            let critical_threshold =
                self.config.alert_threshold * self.config.critical_multiplier;
            if incidents >= critical_threshold {
                if !state.critical_latched {
                    state.critical_latched = true;
                    alerts.push(DetectionAlert {
                        severity: Severity::Critical,
                        incidents_in_window: incidents,
                        window_secs: self.config.window_secs,
                        details: details.to_string(),
                    });
                }
            } else {
                state.critical_latched = false;
            }
        }

        // Callbacks run without the state lock held.
        for alert in &alerts {
            warn!(
                severity = ?alert.severity,
                incidents = alert.incidents_in_window,
                "detection alert"
            );
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(alert);
            }
        }
    }

    /// Rolling metrics snapshot.
    pub fn status(&self) -> DetectionStatus {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        prune(&mut state.events, now, self.config.window_secs);
        let incidents_in_window = state.events.iter().filter(|(_, ok)| !ok).count();
        DetectionStatus {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            incidents_total: state.incidents_total,
            incidents_in_window,
            alert_active: state.warning_latched,
        }
    }
}

fn prune(events: &mut VecDeque<(DateTime<Utc>, bool)>, now: DateTime<Utc>, window_secs: u64) {
    let cutoff = now - chrono::Duration::seconds(window_secs as i64);
    while matches!(events.front(), Some((t, _)) if *t <= cutoff) {
        events.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor() -> (DetectionMonitor, Arc<ManualClock>, Arc<AtomicUsize>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let monitor = DetectionMonitor::new(DetectionConfig::default(), clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.register_alert_callback(move |alert| {
            if alert.severity == Severity::Warning {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (monitor, clock, fired)
    }

    #[test]
    fn test_alert_fires_exactly_once_at_threshold() {
        let (monitor, _clock, fired) = monitor();

        monitor.record(true, "ok");
        monitor.record(true, "ok");
        monitor.record(false, "timeout");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        monitor.record(false, "timeout");
        monitor.record(false, "blocked");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further incidents above the threshold stay latched.
        monitor.record(false, "blocked");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alert_rearms_after_window_slides() {
        let (monitor, clock, fired) = monitor();

        for _ in 0..3 {
            monitor.record(false, "timeout");
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Old incidents fall out of the window; a success re-arms the latch.
        clock.advance(chrono::Duration::seconds(601));
        monitor.record(true, "ok");
        for _ in 0..3 {
            monitor.record(false, "timeout");
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_critical_alert_at_multiple_of_threshold() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let monitor = DetectionMonitor::new(DetectionConfig::default(), clock);
        let criticals = Arc::new(AtomicUsize::new(0));
        let counter = criticals.clone();
        monitor.register_alert_callback(move |alert| {
            if alert.severity == Severity::Critical {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..5 {
            monitor.record(false, "blocked");
        }
        assert_eq!(criticals.load(Ordering::SeqCst), 0);
        monitor.record(false, "blocked");
        assert_eq!(criticals.load(Ordering::SeqCst), 1);
        monitor.record(false, "blocked");
        assert_eq!(criticals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_counts() {
        let (monitor, _clock, _fired) = monitor();
        monitor.record_attempt();
        monitor.record_attempt();
        monitor.record(true, "ok");
        monitor.record(false, "timeout");

        let status = monitor.status();
        assert_eq!(status.total_requests, 2);
        assert_eq!(status.successful_requests, 1);
        assert_eq!(status.incidents_total, 1);
        assert_eq!(status.incidents_in_window, 1);
        assert!(!status.alert_active);
    }

    #[test]
    fn test_classify_keywords() {
        assert_eq!(
            classify("Please complete the CAPTCHA to continue"),
            Some(IncidentKind::Challenge)
        );
        assert_eq!(
            classify("HTTP 429 Too Many Requests"),
            Some(IncidentKind::RateLimit)
        );
        assert_eq!(
            classify("Access Denied - unusual traffic from your network"),
            Some(IncidentKind::BlockPage)
        );
        assert_eq!(
            classify("navigation timed out after 30000ms"),
            Some(IncidentKind::Timeout)
        );
        assert_eq!(classify("Latest listings - page 2"), None);
    }
}
