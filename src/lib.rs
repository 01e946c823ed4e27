//! Umbra runtime — adaptive anti-detection browser automation.
//!
//! Drives a real browser to observe pages unattended without tripping
//! heuristic automated-traffic defenses. The engine decides *when* to
//! act (adaptive scheduler), *how* to act on a page (behavior
//! simulator), *which* identity to present (identity pool + durable
//! profiles), and *how to escalate caution* when the environment pushes
//! back (detection/performance monitors feeding a remediation loop).
//!
//! ```no_run
//! use std::sync::Arc;
//! use umbra_runtime::driver::chromium::ChromiumFactory;
//! use umbra_runtime::{EngineConfig, GotoOptions, StealthEngine};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = StealthEngine::new(EngineConfig::default(), Arc::new(ChromiumFactory))?;
//! engine.initialize("listing-watch").await?;
//! let response = engine.goto("https://example.com", GotoOptions::default()).await?;
//! println!("landed on {} ({:?})", response.final_url, response.status);
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod monitor;
pub mod profile;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::{EngineStatus, GotoOptions, StealthEngine};
pub use error::IdentityError;
