//! Stealth engine composition root.
//!
//! Wires identity, profiles, behavior, scheduling, and monitoring into
//! one navigable facade. Every navigation runs the same ordered
//! pipeline: gate on the scheduler, open a performance span, record the
//! attempt, delegate to the behavior simulator, then report the
//! classified outcome to both monitors and the scheduler. Monitor
//! alerts flow back through a channel-fed remediation task — the
//! system's only feedback loop, one-directional and never polled.

use crate::behavior::{BehaviorConfig, BehaviorSimulator};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::driver::{BrowserDriver, DriverFactory, LaunchOptions, NavigationResponse};
use crate::fingerprint;
use crate::identity::{Identity, IdentityManager};
use crate::monitor::detection::{self, DetectionAlert, DetectionMonitor, DetectionStatus, Severity};
use crate::monitor::performance::{PerformanceAlert, PerformanceMonitor, PerformanceReport};
use crate::profile::{ProfileOptions, ProfileStore};
use crate::scheduler::{AdaptiveScheduler, SchedulerStatus};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default per-navigation timeout.
const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 30_000;

/// Per-call navigation options.
#[derive(Debug, Clone)]
pub struct GotoOptions {
    pub timeout_ms: u64,
}

impl Default for GotoOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_NAVIGATION_TIMEOUT_MS,
        }
    }
}

/// Aggregated engine status for operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub purpose: Option<String>,
    pub profile_id: Option<String>,
    pub identity: Identity,
    pub navigations: u64,
    pub profiles: usize,
    pub driver_connected: bool,
    pub scheduler: SchedulerStatus,
    pub detection: DetectionStatus,
    pub performance: PerformanceReport,
}

/// Alert events funneled into the remediation task.
enum AlertEvent {
    Detection(DetectionAlert),
    Performance(PerformanceAlert),
}

struct ActiveSession {
    driver: Arc<dyn BrowserDriver>,
    profile_id: String,
    purpose: String,
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

/// Anti-detection browser automation engine.
///
/// One engine owns one browser context; callers must serialize
/// navigation calls through a single instance.
pub struct StealthEngine {
    config: EngineConfig,
    identity: Arc<IdentityManager>,
    profiles: Arc<ProfileStore>,
    behavior: Arc<BehaviorSimulator>,
    scheduler: Arc<AdaptiveScheduler>,
    detection: Arc<DetectionMonitor>,
    performance: Arc<PerformanceMonitor>,
    factory: Arc<dyn DriverFactory>,
    session: SessionSlot,
    navigations: AtomicU64,
    saves: Mutex<Vec<JoinHandle<()>>>,
    remediation: Mutex<Option<JoinHandle<()>>>,
}

impl StealthEngine {
    /// Build an engine with the system clock.
    ///
    /// Must be called inside a tokio runtime: construction spawns the
    /// remediation task that consumes monitor alerts.
    pub fn new(config: EngineConfig, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        Self::with_clock(config, factory, Arc::new(SystemClock))
    }

    /// Build an engine against an injected clock, for deterministic
    /// tests.
    pub fn with_clock(
        config: EngineConfig,
        factory: Arc<dyn DriverFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let identity = Arc::new(IdentityManager::new(
            Vec::new(),
            Duration::from_secs(config.identity.rotation_interval_secs),
            clock.clone(),
            config.rng_seed,
        )?);
        let root = config.profile.root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("/tmp"))
                .join(".umbra")
                .join("profiles")
        });
        let profiles = Arc::new(ProfileStore::open(
            root,
            Duration::from_secs(config.profile.session_timeout_secs),
            clock.clone(),
        ));
        let behavior = Arc::new(BehaviorSimulator::new(
            config.behavior.clone(),
            config.rng_seed,
        ));
        let scheduler = Arc::new(AdaptiveScheduler::new(
            config.scheduler.clone(),
            clock.clone(),
            config.rng_seed,
        ));
        let detection = Arc::new(DetectionMonitor::new(config.detection.clone(), clock));
        let performance = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        let session: SessionSlot = Arc::new(Mutex::new(None));

        let (tx, rx) = mpsc::unbounded_channel();
        let detection_tx = tx.clone();
        detection.register_alert_callback(move |alert| {
            let _ = detection_tx.send(AlertEvent::Detection(alert.clone()));
        });
        performance.register_alert_callback(move |alert| {
            let _ = tx.send(AlertEvent::Performance(alert.clone()));
        });

        let remediation = tokio::spawn(remediation_loop(
            rx,
            scheduler.clone(),
            identity.clone(),
            profiles.clone(),
            session.clone(),
            Duration::from_secs(config.scheduler.emergency_duration_secs),
            Duration::from_secs(config.profile.max_age_secs),
        ));

        Ok(Self {
            config,
            identity,
            profiles,
            behavior,
            scheduler,
            detection,
            performance,
            factory,
            session,
            navigations: AtomicU64::new(0),
            saves: Mutex::new(Vec::new()),
            remediation: Mutex::new(Some(remediation)),
        })
    }

    /// Launch a browser for a monitoring purpose.
    ///
    /// Obtains (or creates) the purpose's profile, launches the driver
    /// with the active identity and stealth configuration, and restores
    /// persisted session state into it best-effort.
    pub async fn initialize(&self, purpose: &str) -> Result<()> {
        if self.session.lock().unwrap().is_some() {
            bail!("engine already initialized; close() it first");
        }

        let identity = self.identity.current();
        let profile_id = self.profiles.get_or_create(
            purpose,
            &ProfileOptions {
                user_agent: Some(identity.user_agent.clone()),
                viewport: Some(identity.viewport),
            },
        );

        let on_load_script = self
            .config
            .stealth
            .patch_fingerprint
            .then(|| fingerprint::stealth_script(&identity));
        let driver = self
            .factory
            .launch(LaunchOptions {
                user_agent: identity.user_agent.clone(),
                viewport: identity.viewport,
                accept_language: identity.accept_language.clone(),
                headless: self.config.stealth.headless,
                on_load_script,
            })
            .await
            .context("launching browser driver")?;
        let driver: Arc<dyn BrowserDriver> = Arc::from(driver);

        let (cookies, storage) = self.profiles.restore_session(&profile_id);
        if !cookies.is_empty() {
            if let Err(e) = driver.set_cookies(cookies).await {
                warn!("restoring cookies failed: {e}");
            }
        }
        if !storage.is_empty() {
            if let Err(e) = driver.set_local_storage(storage).await {
                warn!("restoring local storage failed: {e}");
            }
        }

        self.performance.start_monitoring();

        info!(purpose, %profile_id, "engine initialized");
        *self.session.lock().unwrap() = Some(ActiveSession {
            driver,
            profile_id,
            purpose: purpose.to_string(),
        });
        Ok(())
    }

    /// Navigate through the full stealth pipeline.
    ///
    /// Only the navigation's own failure propagates; a served block or
    /// challenge page is recorded as an incident but still returned.
    pub async fn goto(&self, url: &str, opts: GotoOptions) -> Result<NavigationResponse> {
        let (driver, profile_id) = self.active_driver()?;

        // Stage 1: scheduler gate.
        self.scheduler.wait().await;

        // Stage 2: open the performance span.
        let span = self.performance.start_operation("navigation");

        // Stage 3: record the attempt.
        self.detection.record_attempt();

        // Stage 4: delegate to the behavior simulator / driver.
        let result = if self.config.stealth.simulate_behavior {
            self.behavior
                .simulate_page_load(driver.as_ref(), url, opts.timeout_ms)
                .await
        } else {
            driver.navigate(url, opts.timeout_ms).await
        };

        // Stage 5: close the span and report the classified outcome.
        match &result {
            Ok(response) => {
                if let Some(details) = suspect_response(response) {
                    self.performance.end_operation(span, false);
                    self.detection.record(false, &details);
                    self.scheduler.record(false);
                } else {
                    self.performance.end_operation(span, true);
                    self.detection.record(true, url);
                    self.scheduler.record(true);
                }
            }
            Err(e) => {
                let details = match detection::classify(&e.to_string()) {
                    Some(kind) => format!("{kind:?}: {e}"),
                    None => e.to_string(),
                };
                self.performance.end_operation(span, false);
                self.detection.record(false, &details);
                self.scheduler.record(false);
            }
        }

        let count = self.navigations.fetch_add(1, Ordering::SeqCst) + 1;
        let cadence = self.config.stealth.persist_every as u64;
        if cadence > 0 && count % cadence == 0 {
            self.spawn_session_save(driver, profile_id);
        }

        result
    }

    /// Type into an element with human rhythm.
    pub async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let (driver, _) = self.active_driver()?;
        self.behavior
            .simulate_type(driver.as_ref(), selector, text)
            .await
    }

    /// Click an element, approaching it with the mouse first.
    pub async fn click(&self, selector: &str) -> Result<()> {
        let (driver, _) = self.active_driver()?;
        self.behavior
            .simulate_click(driver.as_ref(), selector)
            .await
    }

    /// Evaluate JavaScript on the current page.
    pub async fn evaluate(&self, js: &str) -> Result<serde_json::Value> {
        let (driver, _) = self.active_driver()?;
        driver.execute_js(js).await
    }

    /// Aggregated status snapshot.
    pub async fn get_status(&self) -> EngineStatus {
        let (purpose, profile_id, driver) = {
            let session = self.session.lock().unwrap();
            match session.as_ref() {
                Some(s) => (
                    Some(s.purpose.clone()),
                    Some(s.profile_id.clone()),
                    Some(s.driver.clone()),
                ),
                None => (None, None, None),
            }
        };
        let driver_connected = match driver {
            Some(driver) => driver.is_connected().await,
            None => false,
        };
        EngineStatus {
            initialized: purpose.is_some(),
            purpose,
            profile_id,
            identity: self.identity.current(),
            navigations: self.navigations.load(Ordering::SeqCst),
            profiles: self.profiles.count(),
            driver_connected,
            scheduler: self.scheduler.status(),
            detection: self.detection.status(),
            performance: self.performance.report(),
        }
    }

    /// Force emergency pacing for a duration.
    pub fn set_emergency_mode(&self, duration: Duration) {
        self.scheduler.set_emergency(duration);
    }

    /// Rotate to the next identity and re-apply it to the live driver.
    pub async fn rotate_identity(&self) -> Identity {
        let identity = self.identity.rotate();
        let driver = self.session.lock().unwrap().as_ref().map(|s| s.driver.clone());
        if let Some(driver) = driver {
            apply_identity(driver.as_ref(), &identity).await;
        }
        identity
    }

    /// Sweep expired profiles. Returns the number removed.
    pub fn cleanup_profiles(&self) -> usize {
        self.profiles
            .cleanup_expired(Duration::from_secs(self.config.profile.max_age_secs))
    }

    /// Replace the behavior configuration at runtime.
    pub fn set_behavior_config(&self, config: BehaviorConfig) {
        self.behavior.set_config(config);
    }

    /// Shut the engine down.
    ///
    /// Deterministically stops the remediation task, the resource
    /// sweep, and every pending background save, performs a final
    /// best-effort session save, then closes the driver.
    pub async fn close(&self) -> Result<()> {
        self.abort_background_tasks();
        self.performance.stop_monitoring();

        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            save_session_state(
                session.driver.as_ref(),
                &self.profiles,
                &session.profile_id,
            )
            .await;
            session.driver.close().await.context("closing driver")?;
            info!("engine closed");
        }
        Ok(())
    }

    /// Backstop for engines dropped without `close()`: stop the spawned
    /// tasks so nothing outlives the instance. The driver itself still
    /// requires an explicit `close()` to shut down cleanly.
    fn abort_background_tasks(&self) {
        if let Some(handle) = self.remediation.lock().unwrap().take() {
            handle.abort();
        }
        for handle in self.saves.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    fn active_driver(&self) -> Result<(Arc<dyn BrowserDriver>, String)> {
        let session = self.session.lock().unwrap();
        match session.as_ref() {
            Some(s) => Ok((s.driver.clone(), s.profile_id.clone())),
            None => bail!("engine not initialized; call initialize() first"),
        }
    }

    /// Fire-and-forget session persistence off the navigation path.
    fn spawn_session_save(&self, driver: Arc<dyn BrowserDriver>, profile_id: String) {
        let profiles = self.profiles.clone();
        let handle = tokio::spawn(async move {
            save_session_state(driver.as_ref(), &profiles, &profile_id).await;
        });
        let mut saves = self.saves.lock().unwrap();
        saves.retain(|h| !h.is_finished());
        saves.push(handle);
    }
}

impl Drop for StealthEngine {
    fn drop(&mut self) {
        self.abort_background_tasks();
        self.performance.stop_monitoring();
    }
}

/// Check a served response for block/challenge markers.
fn suspect_response(response: &NavigationResponse) -> Option<String> {
    if let Some(status) = response.status {
        if status == 403 || status == 429 || status == 503 {
            return Some(format!("blocked response status {status}"));
        }
    }
    if let Some(title) = &response.title {
        if let Some(kind) = detection::classify(title) {
            return Some(format!("{kind:?} markers in page title: {title}"));
        }
    }
    None
}

/// Persist the driver's cookies and localStorage into the profile.
/// Failures are logged only.
async fn save_session_state(
    driver: &dyn BrowserDriver,
    profiles: &ProfileStore,
    profile_id: &str,
) {
    let cookies = match driver.cookies().await {
        Ok(cookies) => cookies,
        Err(e) => {
            warn!("session save: reading cookies failed: {e}");
            Vec::new()
        }
    };
    let storage = match driver.local_storage().await {
        Ok(storage) => storage,
        Err(e) => {
            warn!("session save: reading local storage failed: {e}");
            Default::default()
        }
    };
    profiles.save_session(profile_id, &cookies, &storage);
    debug!("session state persisted for profile {profile_id}");
}

async fn apply_identity(driver: &dyn BrowserDriver, identity: &Identity) {
    if let Err(e) = driver.set_user_agent(&identity.user_agent).await {
        warn!("applying rotated user agent failed: {e}");
    }
    if let Err(e) = driver
        .set_viewport(identity.viewport.0, identity.viewport.1)
        .await
    {
        warn!("applying rotated viewport failed: {e}");
    }
}

/// Convert monitor alerts into remediation, one-directionally.
async fn remediation_loop(
    mut rx: mpsc::UnboundedReceiver<AlertEvent>,
    scheduler: Arc<AdaptiveScheduler>,
    identity: Arc<IdentityManager>,
    profiles: Arc<ProfileStore>,
    session: SessionSlot,
    emergency_duration: Duration,
    profile_max_age: Duration,
) {
    while let Some(event) = rx.recv().await {
        match event {
            AlertEvent::Detection(alert) => {
                info!(
                    severity = ?alert.severity,
                    incidents = alert.incidents_in_window,
                    "remediating detection alert"
                );
                scheduler.set_emergency(emergency_duration);
                if alert.severity == Severity::Critical {
                    let rotated = identity.rotate();
                    let driver = session.lock().unwrap().as_ref().map(|s| s.driver.clone());
                    if let Some(driver) = driver {
                        apply_identity(driver.as_ref(), &rotated).await;
                    }
                }
            }
            AlertEvent::Performance(alert) => {
                info!(rss_mb = alert.rss_mb, "remediating memory alert");
                let removed = profiles.cleanup_expired(profile_max_age);
                if removed > 0 {
                    info!("memory remediation removed {removed} expired profiles");
                }
            }
        }
    }
}
