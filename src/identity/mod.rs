//! Browser identity pool with timed rotation.
//!
//! An [`Identity`] is the complete surface presented to a monitored site:
//! user-agent, matching viewport, platform, browser name, and
//! accept-language header. Identities are immutable snapshots drawn from
//! a fixed pool and replaced wholesale on rotation, never mutated in
//! place. Rotation happens on demand or automatically once the active
//! identity is older than the rotation interval.

use crate::clock::{Clock, SystemClock};
use crate::error::{IdentityError, MIN_ROTATION_INTERVAL};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One presented browser identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub platform: String,
    pub browser_name: String,
    pub accept_language: String,
}

/// User-agent strings shipped in the default pool.
const DEFAULT_POOL: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Platform string a page sees via `navigator.platform`, derived from
/// substring patterns in the user-agent.
pub fn platform_of(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows NT") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else if user_agent.contains("Android") {
        "Linux armv8l"
    } else {
        "Linux x86_64"
    }
}

/// Browser family derived from substring patterns in the user-agent.
///
/// Order matters: Edge and Safari user-agents both also claim Chrome or
/// AppleWebKit tokens.
pub fn browser_name_of(user_agent: &str) -> &'static str {
    if user_agent.contains("Edg/") {
        "edge"
    } else if user_agent.contains("Firefox/") {
        "firefox"
    } else if user_agent.contains("Chrome/") {
        "chrome"
    } else if user_agent.contains("Safari/") {
        "safari"
    } else {
        "chrome"
    }
}

/// Primary accept-language header for a user-agent's platform. The
/// pool draw in [`IdentityManager`] may pick an alternate candidate.
pub fn accept_language_of(user_agent: &str) -> &'static str {
    accept_language_candidates(platform_of(user_agent))[0]
}

fn viewport_candidates(platform: &str) -> &'static [(u32, u32)] {
    match platform {
        "Win32" => &[(1920, 1080), (1536, 864), (1366, 768)],
        "MacIntel" => &[(1440, 900), (1680, 1050), (1512, 982)],
        _ => &[(1920, 1080), (1600, 900), (1366, 768)],
    }
}

fn accept_language_candidates(platform: &str) -> &'static [&'static str] {
    match platform {
        "Win32" => &["en-US,en;q=0.9", "en-GB,en;q=0.9", "en-US,en;q=0.8"],
        "MacIntel" => &["en-US,en;q=0.9", "en-CA,en;q=0.9"],
        _ => &["en-US,en;q=0.9", "en-US,en;q=0.5"],
    }
}

struct State {
    active_index: usize,
    active: Identity,
    last_rotated_at: DateTime<Utc>,
    rotation_interval: Duration,
    rng: StdRng,
}

/// Rotating pool of browser identities.
pub struct IdentityManager {
    pool: Vec<String>,
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl IdentityManager {
    /// Create a manager over a user-agent pool.
    ///
    /// Falls back to the built-in pool when `pool` is empty. Signals
    /// [`IdentityError::InvalidInterval`] for intervals under a minute.
    pub fn new(
        pool: Vec<String>,
        rotation_interval: Duration,
        clock: Arc<dyn Clock>,
        rng_seed: Option<u64>,
    ) -> Result<Self, IdentityError> {
        if rotation_interval < MIN_ROTATION_INTERVAL {
            return Err(IdentityError::InvalidInterval(rotation_interval));
        }
        let pool = if pool.is_empty() {
            DEFAULT_POOL.iter().map(|s| s.to_string()).collect()
        } else {
            pool
        };
        let mut rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let active = derive_identity(&pool[0], &mut rng);
        let state = State {
            active_index: 0,
            active,
            last_rotated_at: clock.now(),
            rotation_interval,
            rng,
        };
        Ok(Self {
            pool,
            state: Mutex::new(state),
            clock,
        })
    }

    /// Manager over the built-in pool with default settings.
    pub fn with_defaults() -> Self {
        Self::new(
            Vec::new(),
            Duration::from_secs(3600),
            Arc::new(SystemClock),
            None,
        )
        .expect("default rotation interval is valid")
    }

    /// The active identity, rotating first if it has grown stale.
    pub fn current(&self) -> Identity {
        let mut state = self.state.lock().unwrap();
        let age = self
            .clock
            .now()
            .signed_duration_since(state.last_rotated_at);
        if age.to_std().unwrap_or_default() > state.rotation_interval {
            self.rotate_locked(&mut state);
        }
        state.active.clone()
    }

    /// Advance to the next identity in the pool.
    ///
    /// Always stamps the rotation instant, even for a single-entry pool
    /// where the identity itself is unchanged.
    pub fn rotate(&self) -> Identity {
        let mut state = self.state.lock().unwrap();
        self.rotate_locked(&mut state);
        state.active.clone()
    }

    fn rotate_locked(&self, state: &mut State) {
        state.active_index = (state.active_index + 1) % self.pool.len();
        state.active = derive_identity(&self.pool[state.active_index], &mut state.rng);
        state.last_rotated_at = self.clock.now();
        debug!(
            index = state.active_index,
            browser = %state.active.browser_name,
            "rotated identity"
        );
    }

    /// Select a specific pool slot.
    pub fn set_active_index(&self, index: usize) -> Result<Identity, IdentityError> {
        let mut state = self.state.lock().unwrap();
        if index >= self.pool.len() {
            return Err(IdentityError::InvalidIndex {
                index,
                pool_size: self.pool.len(),
            });
        }
        state.active_index = index;
        state.active = derive_identity(&self.pool[index], &mut state.rng);
        state.last_rotated_at = self.clock.now();
        Ok(state.active.clone())
    }

    /// Change the auto-rotation interval.
    pub fn set_rotation_interval(&self, interval: Duration) -> Result<(), IdentityError> {
        if interval < MIN_ROTATION_INTERVAL {
            return Err(IdentityError::InvalidInterval(interval));
        }
        self.state.lock().unwrap().rotation_interval = interval;
        Ok(())
    }

    /// Viewport consistent with an identity's user-agent.
    pub fn matching_viewport(&self, identity: &Identity) -> (u32, u32) {
        identity.viewport
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn active_index(&self) -> usize {
        self.state.lock().unwrap().active_index
    }

    pub fn last_rotated_at(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_rotated_at
    }
}

/// Build the full identity snapshot for a user-agent string.
///
/// Platform and browser fall out of the string deterministically;
/// viewport and accept-language are drawn from the platform's candidate
/// set so pool entries do not all share one fingerprint.
fn derive_identity(user_agent: &str, rng: &mut StdRng) -> Identity {
    let platform = platform_of(user_agent);
    let viewports = viewport_candidates(platform);
    let languages = accept_language_candidates(platform);
    Identity {
        user_agent: user_agent.to_string(),
        viewport: viewports[rng.gen_range(0..viewports.len())],
        platform: platform.to_string(),
        browser_name: browser_name_of(user_agent).to_string(),
        accept_language: languages[rng.gen_range(0..languages.len())].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_pool() -> Vec<String> {
        vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/124.0.0.0".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Firefox/126.0".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64) Chrome/124.0.0.0".to_string(),
        ]
    }

    fn manager_with_clock(pool: Vec<String>, clock: Arc<ManualClock>) -> IdentityManager {
        IdentityManager::new(pool, Duration::from_secs(3600), clock, Some(42)).unwrap()
    }

    #[test]
    fn test_rotation_wraps_around_pool() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = manager_with_clock(test_pool(), clock);

        manager.set_active_index(2).unwrap();
        manager.rotate();
        assert_eq!(manager.active_index(), 0);
    }

    #[test]
    fn test_single_identity_rotation_is_noop() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let pool = vec![test_pool().remove(0)];
        let manager = manager_with_clock(pool, clock.clone());

        let before = manager.current();
        let stamped = manager.last_rotated_at();
        clock.advance(chrono::Duration::seconds(10));
        let after = manager.rotate();

        assert_eq!(before.user_agent, after.user_agent);
        assert!(manager.last_rotated_at() > stamped);
    }

    #[test]
    fn test_current_auto_rotates_when_stale() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = manager_with_clock(test_pool(), clock.clone());

        assert_eq!(manager.active_index(), 0);
        clock.advance(chrono::Duration::seconds(3601));
        manager.current();
        assert_eq!(manager.active_index(), 1);
    }

    #[test]
    fn test_current_keeps_identity_inside_interval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = manager_with_clock(test_pool(), clock.clone());

        clock.advance(chrono::Duration::seconds(1800));
        manager.current();
        assert_eq!(manager.active_index(), 0);
    }

    #[test]
    fn test_invalid_index_is_rejected() {
        let manager = IdentityManager::with_defaults();
        let err = manager.set_active_index(99).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::InvalidIndex { index: 99, .. }
        ));
    }

    #[test]
    fn test_rotation_interval_below_minimum_is_rejected() {
        let manager = IdentityManager::with_defaults();
        let err = manager
            .set_rotation_interval(Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidInterval(_)));

        let direct = IdentityManager::new(
            Vec::new(),
            Duration::from_secs(10),
            Arc::new(SystemClock),
            None,
        );
        assert!(direct.is_err());
    }

    #[test]
    fn test_derivation_from_user_agent_patterns() {
        assert_eq!(platform_of("Mozilla/5.0 (Windows NT 10.0; Win64)"), "Win32");
        assert_eq!(platform_of("Mozilla/5.0 (Macintosh; Intel)"), "MacIntel");
        assert_eq!(platform_of("Mozilla/5.0 (X11; Linux x86_64)"), "Linux x86_64");

        assert_eq!(browser_name_of("... Chrome/124 Safari/537 Edg/124"), "edge");
        assert_eq!(browser_name_of("... Gecko/20100101 Firefox/126.0"), "firefox");
        assert_eq!(browser_name_of("... Chrome/124.0.0.0 Safari/537.36"), "chrome");
        assert_eq!(browser_name_of("... Version/17.4 Safari/605.1.15"), "safari");

        assert_eq!(
            accept_language_of("Mozilla/5.0 (Windows NT 10.0; Win64)"),
            "en-US,en;q=0.9"
        );
    }

    #[test]
    fn test_viewport_matches_platform_candidates() {
        let manager = manager_with_clock(
            test_pool(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let identity = manager.current();
        let candidates = viewport_candidates(&identity.platform);
        assert!(candidates.contains(&manager.matching_viewport(&identity)));
    }

    #[test]
    fn test_seeded_derivation_is_reproducible() {
        let a = IdentityManager::new(
            test_pool(),
            Duration::from_secs(3600),
            Arc::new(SystemClock),
            Some(7),
        )
        .unwrap();
        let b = IdentityManager::new(
            test_pool(),
            Duration::from_secs(3600),
            Arc::new(SystemClock),
            Some(7),
        )
        .unwrap();
        assert_eq!(a.current(), b.current());
        assert_eq!(a.rotate(), b.rotate());
    }
}
