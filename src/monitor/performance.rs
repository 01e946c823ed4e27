//! Operation timing and resource monitor.
//!
//! Times operations as explicit spans, retains a bounded sample ring for
//! rolling statistics, and runs an optional periodic resource sweep that
//! alerts on resident-memory growth. The sweep task is cancellable and
//! stopping it is idempotent.

use crate::config::PerformanceConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle for an in-flight operation span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

/// A completed, timed operation.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub id: u64,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
}

/// Coarse health grade derived from rolling average latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Grade {
    fn from_average_ms(avg: f64) -> Self {
        if avg < 1_000.0 {
            Grade::Excellent
        } else if avg < 3_000.0 {
            Grade::Good
        } else if avg < 8_000.0 {
            Grade::Fair
        } else {
            Grade::Poor
        }
    }
}

/// Rolling report over the retained samples.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub operations: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub grade: Grade,
    pub memory_rss_mb: Option<f64>,
    pub monitoring: bool,
}

/// Resource alert raised by the periodic sweep.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    pub rss_mb: f64,
    pub limit_mb: u64,
}

type AlertCallback = Box<dyn Fn(&PerformanceAlert) + Send + Sync>;

struct Pending {
    kind: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

struct State {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    samples: VecDeque<PerformanceSample>,
    memory_latched: bool,
}

/// Span-based latency and resource observer.
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    state: Mutex<State>,
    callbacks: Mutex<Vec<AlertCallback>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                next_id: 0,
                pending: HashMap::new(),
                samples: VecDeque::new(),
                memory_latched: false,
            }),
            callbacks: Mutex::new(Vec::new()),
            sweep: Mutex::new(None),
        }
    }

    /// Register a callback invoked when a resource threshold is crossed.
    pub fn register_alert_callback(
        &self,
        callback: impl Fn(&PerformanceAlert) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Open a timing span.
    pub fn start_operation(&self, kind: &str) -> OperationId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            id,
            Pending {
                kind: kind.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        OperationId(id)
    }

    /// Close a span and retain its sample.
    ///
    /// An unknown id is logged and ignored; span bookkeeping must never
    /// fail the operation being timed.
    pub fn end_operation(&self, id: OperationId, success: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.pending.remove(&id.0) else {
            warn!("ending unknown operation span {:?}", id);
            return;
        };
        let duration = pending.started.elapsed();
        let sample = PerformanceSample {
            id: id.0,
            kind: pending.kind,
            started_at: pending.started_at,
            ended_at: Utc::now(),
            success,
            duration_ms: duration.as_millis() as u64,
        };
        if state.samples.len() == self.config.max_samples {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
    }

    /// Rolling statistics over retained samples.
    pub fn report(&self) -> PerformanceReport {
        let state = self.state.lock().unwrap();
        let operations = state.samples.len();
        let (successes, total_ms) = state.samples.iter().fold((0usize, 0u64), |(s, ms), x| {
            (s + usize::from(x.success), ms + x.duration_ms)
        });
        let average = if operations == 0 {
            0.0
        } else {
            total_ms as f64 / operations as f64
        };
        PerformanceReport {
            operations,
            success_rate: if operations == 0 {
                1.0
            } else {
                successes as f64 / operations as f64
            },
            average_duration_ms: average,
            grade: Grade::from_average_ms(average),
            memory_rss_mb: read_rss_mb(),
            monitoring: self.sweep.lock().unwrap().is_some(),
        }
    }

    /// Start the periodic resource sweep. A second call replaces the
    /// previous sweep task.
    pub fn start_monitoring(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sampling_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(rss_mb) = read_rss_mb() {
                    monitor.evaluate_memory(rss_mb);
                }
            }
        });
        let previous = self.sweep.lock().unwrap().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!("performance sweep started");
    }

    /// Stop the resource sweep. Safe to call when not running.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.sweep.lock().unwrap().take() {
            handle.abort();
            debug!("performance sweep stopped");
        }
    }

    /// Check a memory reading against the alert threshold, firing each
    /// registered callback once per crossing.
    fn evaluate_memory(&self, rss_mb: f64) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if rss_mb > self.config.memory_alert_mb as f64 {
                let crossed = !state.memory_latched;
                state.memory_latched = true;
                crossed
            } else {
                state.memory_latched = false;
                false
            }
        };
        if fire {
            let alert = PerformanceAlert {
                rss_mb,
                limit_mb: self.config.memory_alert_mb,
            };
            warn!(rss_mb, limit_mb = alert.limit_mb, "memory threshold crossed");
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(&alert);
            }
        }
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Resident set size in megabytes, read from `/proc/self/status`.
/// Best-effort; returns `None` off Linux or on parse failure.
fn read_rss_mb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
