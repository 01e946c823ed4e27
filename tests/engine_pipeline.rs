//! End-to-end engine tests over a scripted mock driver.
//!
//! Cover the navigation pipeline ordering, incident classification,
//! alert-to-remediation wiring, session persistence across engine
//! restarts, and deterministic shutdown.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use umbra_runtime::config::EngineConfig;
use umbra_runtime::driver::{
    BrowserDriver, Cookie, DriverFactory, LaunchOptions, NavigationResponse,
};
use umbra_runtime::engine::{GotoOptions, StealthEngine};

/// Scripted outcome for one navigation.
#[derive(Clone, Copy)]
enum NavScript {
    Ok { status: u16, title: &'static str },
    Fail(&'static str),
}

/// State shared between the test, the factory, and every driver it
/// hands out.
#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<String>>,
    nav_script: Mutex<VecDeque<NavScript>>,
    launches: Mutex<Vec<LaunchOptions>>,
    cookies: Mutex<Vec<Cookie>>,
    storage: Mutex<HashMap<String, String>>,
    closed: Mutex<bool>,
}

impl MockState {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn script(&self, outcomes: &[NavScript]) {
        self.nav_script
            .lock()
            .unwrap()
            .extend(outcomes.iter().cloned());
    }
}

struct MockDriver {
    state: Arc<MockState>,
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn navigate(&self, url: &str, _timeout_ms: u64) -> Result<NavigationResponse> {
        self.state.record(format!("navigate:{url}"));
        let script = self.state.nav_script.lock().unwrap().pop_front();
        match script.unwrap_or(NavScript::Ok {
            status: 200,
            title: "ok",
        }) {
            NavScript::Ok { status, title } => Ok(NavigationResponse {
                url: url.to_string(),
                final_url: url.to_string(),
                status: Some(status),
                title: Some(title.to_string()),
                elapsed_ms: 12,
            }),
            NavScript::Fail(message) => bail!("{message}"),
        }
    }

    async fn execute_js(&self, _js: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!(true))
    }

    async fn visible_text_len(&self) -> Result<usize> {
        Ok(600)
    }

    async fn move_mouse(&self, _x: f64, _y: f64) -> Result<()> {
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.state.record(format!("click:{selector}"));
        Ok(())
    }

    async fn focus(&self, selector: &str) -> Result<()> {
        self.state.record(format!("focus:{selector}"));
        Ok(())
    }

    async fn type_char(&self, _c: char) -> Result<()> {
        self.state.record("type_char");
        Ok(())
    }

    async fn scroll_by(&self, _dx: f64, _dy: f64) -> Result<()> {
        Ok(())
    }

    async fn hover(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn element_center(&self, _selector: &str) -> Result<(f64, f64)> {
        Ok((320.0, 240.0))
    }

    async fn viewport(&self) -> Result<(u32, u32)> {
        Ok((1280, 800))
    }

    async fn set_viewport(&self, w: u32, h: u32) -> Result<()> {
        self.state.record(format!("set_viewport:{w}x{h}"));
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.state.record(format!("set_user_agent:{user_agent}"));
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        Ok(self.state.cookies.lock().unwrap().clone())
    }

    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()> {
        self.state
            .record(format!("set_cookies:{}", cookies.len()));
        *self.state.cookies.lock().unwrap() = cookies;
        Ok(())
    }

    async fn local_storage(&self) -> Result<HashMap<String, String>> {
        Ok(self.state.storage.lock().unwrap().clone())
    }

    async fn set_local_storage(&self, entries: HashMap<String, String>) -> Result<()> {
        self.state
            .record(format!("set_local_storage:{}", entries.len()));
        *self.state.storage.lock().unwrap() = entries;
        Ok(())
    }

    async fn inject_on_load(&self, _script: &str) -> Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !*self.state.closed.lock().unwrap()
    }

    async fn close(&self) -> Result<()> {
        *self.state.closed.lock().unwrap() = true;
        self.state.record("close");
        Ok(())
    }
}

struct MockFactory {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserDriver>> {
        self.state.launches.lock().unwrap().push(opts);
        Ok(Box::new(MockDriver {
            state: self.state.clone(),
        }))
    }
}

fn test_config(root: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.rng_seed = Some(5);
    config.profile.root = Some(root.to_path_buf());
    config.stealth.persist_every = 0;
    config
}

fn engine_with_state(config: EngineConfig) -> (StealthEngine, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let factory = Arc::new(MockFactory {
        state: state.clone(),
    });
    let engine = StealthEngine::new(config, factory).unwrap();
    (engine, state)
}

/// Let queued alert events drain through the remediation task.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_goto_requires_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _state) = engine_with_state(test_config(dir.path()));

    let err = engine
        .goto("https://example.com", GotoOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not initialized"));
}

#[tokio::test(start_paused = true)]
async fn test_initialize_presents_identity_and_stealth_script() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));

    engine.initialize("listing-watch").await.unwrap();

    {
        let launches = state.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        let opts = &launches[0];
        assert!(opts.user_agent.starts_with("Mozilla/5.0"));
        assert!(opts.viewport.0 > 0);
        let script = opts.on_load_script.as_ref().expect("fingerprint script");
        assert!(script.contains("webdriver"));
    }

    let status = engine.get_status().await;
    assert!(status.initialized);
    assert_eq!(status.purpose.as_deref(), Some("listing-watch"));
    assert!(status.driver_connected);
}

#[tokio::test(start_paused = true)]
async fn test_successful_navigation_feeds_all_observers() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();

    let response = engine
        .goto("https://example.com/a", GotoOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, Some(200));

    assert!(state
        .calls()
        .iter()
        .any(|c| c == "navigate:https://example.com/a"));

    let status = engine.get_status().await;
    assert_eq!(status.navigations, 1);
    assert_eq!(status.detection.total_requests, 1);
    assert_eq!(status.detection.successful_requests, 1);
    assert_eq!(status.performance.operations, 1);
    assert!(!status.scheduler.emergency);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_failure_propagates_and_escalates() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();
    state.script(&[NavScript::Fail("navigation timed out after 30000ms")]);

    let err = engine
        .goto("https://example.com", GotoOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    let status = engine.get_status().await;
    assert!(status.scheduler.emergency);
    assert_eq!(status.detection.incidents_total, 1);
    assert_eq!(status.detection.successful_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_block_page_is_returned_but_recorded_as_incident() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();
    state.script(&[NavScript::Ok {
        status: 200,
        title: "Access Denied - unusual traffic",
    }]);

    let response = engine
        .goto("https://example.com", GotoOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, Some(200));

    let status = engine.get_status().await;
    assert_eq!(status.detection.incidents_total, 1);
    assert!(status.scheduler.emergency);
}

#[tokio::test(start_paused = true)]
async fn test_critical_alert_rotates_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();

    let before = engine.get_status().await.identity;

    // Default critical threshold is 6 incidents inside the window.
    state.script(&[NavScript::Fail("HTTP 429 Too Many Requests"); 6]);
    for _ in 0..6 {
        let _ = engine.goto("https://example.com", GotoOptions::default()).await;
    }
    settle().await;

    let after = engine.get_status().await.identity;
    assert_ne!(before.user_agent, after.user_agent);
    assert!(state
        .calls()
        .iter()
        .any(|c| c.starts_with("set_user_agent:")));
}

#[tokio::test(start_paused = true)]
async fn test_session_persists_across_engine_restarts() {
    let dir = tempfile::tempdir().unwrap();

    let profile_id = {
        let (engine, state) = engine_with_state(test_config(dir.path()));
        engine.initialize("listing-watch").await.unwrap();
        state.cookies.lock().unwrap().push(Cookie {
            name: "sid".to_string(),
            value: "abc".to_string(),
            domain: ".example.com".to_string(),
            path: "/".to_string(),
            expires: None,
            http_only: true,
            secure: true,
        });
        state
            .storage
            .lock()
            .unwrap()
            .insert("seen".to_string(), "42".to_string());
        let profile_id = engine.get_status().await.profile_id.unwrap();
        engine.close().await.unwrap();
        profile_id
    };

    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();

    // Same purpose resumes the same profile with its saved session.
    assert_eq!(
        engine.get_status().await.profile_id.as_deref(),
        Some(profile_id.as_str())
    );
    let calls = state.calls();
    assert!(calls.iter().any(|c| c == "set_cookies:1"));
    assert!(calls.iter().any(|c| c == "set_local_storage:1"));
    engine.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_saves_run_off_the_critical_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.stealth.persist_every = 2;
    let (engine, state) = engine_with_state(config);
    engine.initialize("listing-watch").await.unwrap();
    state.cookies.lock().unwrap().push(Cookie {
        name: "sid".to_string(),
        value: "x".to_string(),
        domain: ".example.com".to_string(),
        path: "/".to_string(),
        expires: None,
        http_only: false,
        secure: false,
    });

    for i in 0..4 {
        engine
            .goto(&format!("https://example.com/{i}"), GotoOptions::default())
            .await
            .unwrap();
    }
    settle().await;

    let profile_id = engine.get_status().await.profile_id.unwrap();
    let cookie_file = dir.path().join(&profile_id).join("cookies.json");
    assert!(cookie_file.exists());
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_monitoring_and_driver() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();
    assert!(engine.get_status().await.performance.monitoring);

    engine.close().await.unwrap();

    let status = engine.get_status().await;
    assert!(!status.initialized);
    assert!(!status.performance.monitoring);
    assert!(state.calls().iter().any(|c| c == "close"));
}

#[tokio::test(start_paused = true)]
async fn test_type_and_click_go_through_behavior_layer() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, state) = engine_with_state(test_config(dir.path()));
    engine.initialize("listing-watch").await.unwrap();

    engine.type_text("#search", "rust").await.unwrap();
    engine.click("button.go").await.unwrap();

    let calls = state.calls();
    assert!(calls.iter().any(|c| c == "focus:#search"));
    assert_eq!(calls.iter().filter(|c| *c == "type_char").count(), 4);
    assert!(calls.iter().any(|c| c == "click:button.go"));
}
