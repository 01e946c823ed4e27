//! Navigation outcome monitors.
//!
//! Two mutually independent observers fed by the engine's navigation
//! pipeline: [`detection::DetectionMonitor`] watches for signs the
//! environment has noticed the automation, [`performance::PerformanceMonitor`]
//! watches latency and resource health. Neither reads the other's state;
//! both report through registered alert callbacks.

pub mod detection;
pub mod performance;
