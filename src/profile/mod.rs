//! Durable per-purpose browsing profiles.
//!
//! A profile owns a directory holding `metadata.json`, `cookies.json`,
//! and `localStorage.json`, so a monitoring task resumes with the same
//! identity and session state across restarts. Metadata is hydrated into
//! memory once when the store opens; every file write afterwards is
//! best-effort — I/O failures are logged and callers proceed with
//! empty/default session state.

use crate::clock::{Clock, SystemClock};
use crate::driver::Cookie;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const COOKIES_FILE: &str = "cookies.json";
const STORAGE_FILE: &str = "localStorage.json";

/// Metadata record persisted per profile directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMeta {
    pub id: String,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub session_count: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub viewport: Option<(u32, u32)>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Attributes recorded when a profile is first created.
#[derive(Debug, Clone, Default)]
pub struct ProfileOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookieFile {
    saved: DateTime<Utc>,
    cookies: Vec<Cookie>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageFile {
    saved: DateTime<Utc>,
    data: HashMap<String, String>,
}

/// Store of browsing profiles under one root directory.
pub struct ProfileStore {
    root: PathBuf,
    session_timeout: Duration,
    clock: Arc<dyn Clock>,
    metas: Mutex<HashMap<String, ProfileMeta>>,
}

impl ProfileStore {
    /// Open a store, hydrating metadata from every profile directory
    /// under `root`. Unreadable entries are skipped with a warning.
    pub fn open(root: PathBuf, session_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!("failed to create profile root {}: {e}", root.display());
        }
        let metas = hydrate(&root);
        debug!("profile store opened with {} profiles", metas.len());
        Self {
            root,
            session_timeout,
            clock,
            metas: Mutex::new(metas),
        }
    }

    /// Store under the default root `~/.umbra/profiles`.
    pub fn open_default(session_timeout: Duration) -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".umbra")
            .join("profiles");
        Self::open(root, session_timeout, Arc::new(SystemClock))
    }

    /// Find the profile for a purpose, or create one.
    ///
    /// A non-expired profile tagged with `purpose` is reused (most
    /// recently used wins) with its usage metadata updated; otherwise a
    /// fresh profile directory is created.
    pub fn get_or_create(&self, purpose: &str, opts: &ProfileOptions) -> String {
        let now = self.clock.now();
        let mut metas = self.metas.lock().unwrap();

        let existing = metas
            .values()
            .filter(|m| m.tags.iter().any(|t| t == purpose))
            .filter(|m| !is_expired(m, now, self.session_timeout))
            .max_by_key(|m| m.last_used)
            .map(|m| m.id.clone());

        if let Some(id) = existing {
            let meta = metas.get_mut(&id).expect("profile vanished under lock");
            meta.last_used = meta.last_used.max(now);
            meta.session_count += 1;
            self.write_metadata(meta);
            debug!("reusing profile {id} for purpose {purpose}");
            return id;
        }

        let id = Uuid::new_v4().to_string();
        let meta = ProfileMeta {
            id: id.clone(),
            created: now,
            last_used: now,
            session_count: 1,
            user_agent: opts.user_agent.clone(),
            viewport: opts.viewport,
            tags: vec![purpose.to_string()],
        };
        if let Err(e) = std::fs::create_dir_all(self.profile_dir(&id)) {
            warn!("failed to create profile dir {id}: {e}");
        }
        self.write_metadata(&meta);
        metas.insert(id.clone(), meta);
        debug!("created profile {id} for purpose {purpose}");
        id
    }

    /// Persist cookies and localStorage for a profile. Best-effort.
    pub fn save_session(
        &self,
        profile_id: &str,
        cookies: &[Cookie],
        storage: &HashMap<String, String>,
    ) {
        let now = self.clock.now();
        let dir = self.profile_dir(profile_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("failed to create profile dir {profile_id}: {e}");
            return;
        }

        let cookie_file = CookieFile {
            saved: now,
            cookies: cookies.to_vec(),
        };
        write_json(&dir.join(COOKIES_FILE), &cookie_file);

        let storage_file = StorageFile {
            saved: now,
            data: storage.clone(),
        };
        write_json(&dir.join(STORAGE_FILE), &storage_file);

        self.touch(profile_id);
    }

    /// Load the persisted session for a profile.
    ///
    /// Missing or corrupt files yield empty state rather than an error.
    pub fn restore_session(&self, profile_id: &str) -> (Vec<Cookie>, HashMap<String, String>) {
        let dir = self.profile_dir(profile_id);
        let cookies = read_json::<CookieFile>(&dir.join(COOKIES_FILE))
            .map(|f| f.cookies)
            .unwrap_or_default();
        let storage = read_json::<StorageFile>(&dir.join(STORAGE_FILE))
            .map(|f| f.data)
            .unwrap_or_default();
        (cookies, storage)
    }

    /// Bump a profile's last-used instant. Monotonic.
    pub fn touch(&self, profile_id: &str) {
        let now = self.clock.now();
        let mut metas = self.metas.lock().unwrap();
        if let Some(meta) = metas.get_mut(profile_id) {
            meta.last_used = meta.last_used.max(now);
            self.write_metadata(meta);
        }
    }

    /// Delete every profile unused for longer than `max_age`.
    ///
    /// Returns the number of profiles removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut metas = self.metas.lock().unwrap();
        let stale: Vec<String> = metas
            .values()
            .filter(|m| is_expired(m, now, max_age))
            .map(|m| m.id.clone())
            .collect();

        for id in &stale {
            metas.remove(id);
            let dir = self.profile_dir(id);
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("failed to remove profile dir {id}: {e}");
            }
            debug!("removed expired profile {id}");
        }
        stale.len()
    }

    /// Metadata snapshot for a profile.
    pub fn meta(&self, profile_id: &str) -> Option<ProfileMeta> {
        self.metas.lock().unwrap().get(profile_id).cloned()
    }

    /// Number of known profiles.
    pub fn count(&self) -> usize {
        self.metas.lock().unwrap().len()
    }

    fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.root.join(profile_id)
    }

    fn write_metadata(&self, meta: &ProfileMeta) {
        write_json(&self.profile_dir(&meta.id).join(METADATA_FILE), meta);
    }
}

fn is_expired(meta: &ProfileMeta, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(meta.last_used)
        .to_std()
        .map(|idle| idle > timeout)
        .unwrap_or(false)
}

fn hydrate(root: &Path) -> HashMap<String, ProfileMeta> {
    let mut metas = HashMap::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to scan profile root {}: {e}", root.display());
            return metas;
        }
    };
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let path = entry.path().join(METADATA_FILE);
        if let Some(meta) = read_json::<ProfileMeta>(&path) {
            metas.insert(meta.id.clone(), meta);
        }
    }
    metas
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize {}: {e}", path.display());
            return;
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        warn!("failed to write {}: {e}", path.display());
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("corrupt profile file {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_json_diff::assert_json_include;

    fn test_store(dir: &Path, clock: Arc<ManualClock>) -> ProfileStore {
        ProfileStore::open(dir.to_path_buf(), Duration::from_secs(86_400), clock)
    }

    fn sample_cookie() -> Cookie {
        Cookie {
            name: "sid".to_string(),
            value: "abc123".to_string(),
            domain: ".example.com".to_string(),
            path: "/".to_string(),
            expires: Some(2_000_000_000.0),
            http_only: true,
            secure: true,
        }
    }

    #[test]
    fn test_get_or_create_reuses_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock.clone());

        let first = store.get_or_create("listings", &ProfileOptions::default());
        clock.advance(chrono::Duration::hours(1));
        let second = store.get_or_create("listings", &ProfileOptions::default());
        assert_eq!(first, second);
        assert_eq!(store.meta(&first).unwrap().session_count, 2);
    }

    #[test]
    fn test_get_or_create_renews_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock.clone());

        let first = store.get_or_create("listings", &ProfileOptions::default());
        clock.advance(chrono::Duration::hours(25));
        let second = store.get_or_create("listings", &ProfileOptions::default());
        assert_ne!(first, second);
    }

    #[test]
    fn test_purposes_get_distinct_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock);

        let a = store.get_or_create("listings", &ProfileOptions::default());
        let b = store.get_or_create("forums", &ProfileOptions::default());
        assert_ne!(a, b);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock);

        let id = store.get_or_create("listings", &ProfileOptions::default());
        let cookies = vec![sample_cookie()];
        let storage: HashMap<String, String> =
            [("theme".to_string(), "dark".to_string())].into();

        store.save_session(&id, &cookies, &storage);
        let (restored_cookies, restored_storage) = store.restore_session(&id);
        assert_eq!(restored_cookies, cookies);
        assert_eq!(restored_storage, storage);
    }

    #[test]
    fn test_restore_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock);

        let id = store.get_or_create("listings", &ProfileOptions::default());
        let (cookies, storage) = store.restore_session(&id);
        assert!(cookies.is_empty());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_corrupt_cookie_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock);

        let id = store.get_or_create("listings", &ProfileOptions::default());
        std::fs::write(dir.path().join(&id).join(COOKIES_FILE), "{not json").unwrap();
        let (cookies, _) = store.restore_session(&id);
        assert!(cookies.is_empty());
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now();
        let id = {
            let clock = Arc::new(ManualClock::new(start));
            let store = test_store(dir.path(), clock);
            store.get_or_create("listings", &ProfileOptions::default())
        };

        let clock = Arc::new(ManualClock::new(start + chrono::Duration::hours(2)));
        let store = test_store(dir.path(), clock);
        let reused = store.get_or_create("listings", &ProfileOptions::default());
        assert_eq!(id, reused);
    }

    #[test]
    fn test_cleanup_removes_only_stale_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock.clone());

        let old = store.get_or_create("stale", &ProfileOptions::default());
        clock.advance(chrono::Duration::days(31));
        let fresh = store.get_or_create("fresh", &ProfileOptions::default());

        let removed = store.cleanup_expired(Duration::from_secs(2_592_000));
        assert_eq!(removed, 1);
        assert!(store.meta(&old).is_none());
        assert!(store.meta(&fresh).is_some());
        assert!(!dir.path().join(&old).exists());
    }

    #[test]
    fn test_last_used_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock.clone());

        let id = store.get_or_create("listings", &ProfileOptions::default());
        let after_create = store.meta(&id).unwrap().last_used;

        // A clock that jumps backwards must not move last_used back.
        clock.set(after_create - chrono::Duration::hours(1));
        store.touch(&id);
        assert_eq!(store.meta(&id).unwrap().last_used, after_create);
    }

    #[test]
    fn test_metadata_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = test_store(dir.path(), clock);

        let opts = ProfileOptions {
            user_agent: Some("Mozilla/5.0 test".to_string()),
            viewport: Some((1920, 1080)),
        };
        let id = store.get_or_create("listings", &opts);

        let raw =
            std::fs::read_to_string(dir.path().join(&id).join(METADATA_FILE)).unwrap();
        let actual: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_json_include!(
            actual: actual,
            expected: serde_json::json!({
                "id": id,
                "sessionCount": 1,
                "userAgent": "Mozilla/5.0 test",
                "tags": ["listings"],
            })
        );
    }
}
