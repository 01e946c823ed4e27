//! Engine configuration surface.
//!
//! Read once at construction. Every knob has a default tuned for
//! unattended monitoring; embedders usually override only the profile
//! root and a handful of intervals.

use crate::behavior::BehaviorConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a [`StealthEngine`](crate::engine::StealthEngine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stealth: StealthConfig,
    pub scheduler: SchedulerConfig,
    pub behavior: BehaviorConfig,
    pub identity: IdentityConfig,
    pub profile: ProfileConfig,
    pub detection: DetectionConfig,
    pub performance: PerformanceConfig,
    /// Seed for all jitter and behavior randomness. `None` seeds from
    /// entropy; set it to make a run reproducible.
    pub rng_seed: Option<u64>,
}

/// Feature toggles for the stealth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    /// Inject the fingerprint patch script on every new document.
    pub patch_fingerprint: bool,
    /// Shadow navigations with simulated human interaction.
    pub simulate_behavior: bool,
    /// Persist session state every Nth navigation (0 disables).
    pub persist_every: u32,
    /// Launch the browser headless.
    pub headless: bool,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            patch_fingerprint: true,
            simulate_behavior: true,
            persist_every: 5,
            headless: true,
        }
    }
}

/// A base/variance pair for one timing pattern, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingPattern {
    pub base_ms: u64,
    pub variance_ms: u64,
}

/// Timing patterns selected by context, highest priority first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPatterns {
    pub emergency: TimingPattern,
    pub night: TimingPattern,
    pub weekend: TimingPattern,
    pub active: TimingPattern,
    pub idle: TimingPattern,
}

impl Default for TimingPatterns {
    fn default() -> Self {
        Self {
            emergency: TimingPattern {
                base_ms: 300_000,
                variance_ms: 120_000,
            },
            night: TimingPattern {
                base_ms: 180_000,
                variance_ms: 60_000,
            },
            weekend: TimingPattern {
                base_ms: 120_000,
                variance_ms: 45_000,
            },
            active: TimingPattern {
                base_ms: 45_000,
                variance_ms: 10_000,
            },
            idle: TimingPattern {
                base_ms: 90_000,
                variance_ms: 30_000,
            },
        }
    }
}

/// Adaptive scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard floor for any computed interval.
    pub min_interval_ms: u64,
    /// Hard ceiling outside emergency mode.
    pub max_interval_ms: u64,
    /// Requests inside the burst window before a penalty applies.
    pub burst_threshold: usize,
    /// Window over which requests count toward the burst penalty.
    pub burst_window_secs: u64,
    /// Age at which a request stops contributing to the penalty.
    pub decay_window_secs: u64,
    /// Cap on the burst penalty multiplier.
    pub max_penalty_multiplier: f64,
    /// How long emergency mode lasts after the latest failure.
    pub emergency_duration_secs: u64,
    /// Navigation timestamps retained for heuristics.
    pub history_capacity: usize,
    /// Window for the "active session" predicate.
    pub active_session_window_secs: u64,
    /// Requests inside that window that make the session active.
    pub active_session_min_requests: usize,
    pub patterns: TimingPatterns,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 30_000,
            max_interval_ms: 600_000,
            burst_threshold: 8,
            burst_window_secs: 300,
            decay_window_secs: 1800,
            max_penalty_multiplier: 1.5,
            emergency_duration_secs: 3600,
            history_capacity: 100,
            active_session_window_secs: 600,
            active_session_min_requests: 3,
            patterns: TimingPatterns::default(),
        }
    }
}

/// Identity pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Auto-rotation interval. Must be at least 60 seconds.
    pub rotation_interval_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 3600,
        }
    }
}

/// Profile store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Root directory for profile state. Defaults to `~/.umbra/profiles`.
    pub root: Option<PathBuf>,
    /// A profile is reused while idle for less than this.
    pub session_timeout_secs: u64,
    /// A profile unused beyond this is deleted by the cleanup sweep.
    pub max_age_secs: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            root: None,
            session_timeout_secs: 86_400,
            max_age_secs: 2_592_000,
        }
    }
}

/// Detection monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Rolling window over which incidents are counted.
    pub window_secs: u64,
    /// Incidents inside the window that raise an alert.
    pub alert_threshold: usize,
    /// Multiple of the alert threshold that raises a critical alert.
    pub critical_multiplier: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            alert_threshold: 3,
            critical_multiplier: 2,
        }
    }
}

/// Performance monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Latency samples retained for rolling statistics.
    pub max_samples: usize,
    /// Resource sweep interval for `start_monitoring`.
    pub sampling_interval_secs: u64,
    /// Resident memory above this raises a resource alert.
    pub memory_alert_mb: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_samples: 200,
            sampling_interval_secs: 30,
            memory_alert_mb: 1024,
        }
    }
}
