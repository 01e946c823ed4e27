//! Browser driver capability seam.
//!
//! The engine never talks to a browser directly; it orchestrates a
//! [`BrowserDriver`] obtained from a [`DriverFactory`]. Production uses
//! the chromiumoxide implementation in [`chromium`]; tests substitute a
//! scripted mock.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Options for launching a browser with a specific presented identity.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub accept_language: String,
    pub headless: bool,
    /// Script injected into every new document before page scripts run.
    pub on_load_script: Option<String>,
}

/// Outcome of a completed navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResponse {
    /// URL that was requested.
    pub url: String,
    /// URL the browser ended up on after redirects.
    pub final_url: String,
    /// HTTP status of the main document, when the driver reports one.
    pub status: Option<u16>,
    /// Document title after load.
    pub title: Option<String>,
    /// Wall time the navigation took.
    pub elapsed_ms: u64,
}

/// A browser cookie as persisted in a profile's `cookies.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix timestamp; `None` for session cookies.
    pub expires: Option<f64>,
    pub http_only: bool,
    pub secure: bool,
}

/// Capability contract the engine requires from a live browser.
///
/// Every method is fallible; callers decide per the error-handling policy
/// whether a failure propagates (navigation) or degrades (behavior,
/// persistence).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Navigate the page and wait for load, up to `timeout_ms`.
    async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<NavigationResponse>;

    /// Evaluate a JavaScript expression in the page.
    async fn execute_js(&self, js: &str) -> Result<serde_json::Value>;

    /// Length of the page's visible text, for reading-time estimates.
    async fn visible_text_len(&self) -> Result<usize>;

    /// Move the mouse to absolute page coordinates.
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    /// Click the first element matching the selector.
    async fn click(&self, selector: &str) -> Result<()>;

    /// Focus the first element matching the selector.
    async fn focus(&self, selector: &str) -> Result<()>;

    /// Type one character into the focused element.
    async fn type_char(&self, c: char) -> Result<()>;

    /// Scroll the page by the given pixel deltas.
    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;

    /// Hover the first element matching the selector.
    async fn hover(&self, selector: &str) -> Result<()>;

    /// Center coordinates of the first element matching the selector.
    async fn element_center(&self, selector: &str) -> Result<(f64, f64)>;

    /// Current viewport size.
    async fn viewport(&self) -> Result<(u32, u32)>;

    /// Override the viewport size.
    async fn set_viewport(&self, width: u32, height: u32) -> Result<()>;

    /// Override the user-agent presented by the page.
    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    /// All cookies visible to the page.
    async fn cookies(&self) -> Result<Vec<Cookie>>;

    /// Install cookies into the browser context.
    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()>;

    /// Snapshot of the page's localStorage.
    async fn local_storage(&self) -> Result<HashMap<String, String>>;

    /// Restore localStorage entries into the page.
    async fn set_local_storage(&self, entries: HashMap<String, String>) -> Result<()>;

    /// Inject a script to run in every new document.
    async fn inject_on_load(&self, script: &str) -> Result<()>;

    /// Liveness probe.
    async fn is_connected(&self) -> bool;

    /// Shut the browser down.
    async fn close(&self) -> Result<()>;
}

/// Launches browsers. One factory serves many engine instances.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserDriver>>;
}
