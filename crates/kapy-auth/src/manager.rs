//! Whitelist-based authorization with channel scoping and persisted state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownUser,
    WrongChannel,
    RateLimited,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::UnknownUser => "unknown_user",
            DenyReason::WrongChannel => "wrong_channel",
            DenyReason::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    Denied(DenyReason),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allowed)
    }
}

/// Serialized auth state. BTree collections keep the JSON canonical so a
/// dump → load → dump round trip is byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthState {
    #[serde(default)]
    channel_allowed: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    admin_users: BTreeSet<String>,
    #[serde(default)]
    system_admin_users: BTreeSet<String>,
}

/// Legacy flat schema: a bare allowlist applied to every channel.
#[derive(Debug, Deserialize)]
struct LegacyAuthState {
    allowed_users: Vec<serde_json::Value>,
}

struct Inner {
    state: AuthState,
    limiter: crate::rate_limit::RateLimiter,
}

pub struct AuthManager {
    state_file: PathBuf,
    inner: Mutex<Inner>,
}

impl AuthManager {
    pub fn new(state_file: impl Into<PathBuf>, rate_limit_per_minute: u32) -> Self {
        let state_file = state_file.into();
        let state = Self::load(&state_file);
        info!(
            channels = state.channel_allowed.len(),
            admins = state.admin_users.len(),
            "auth manager initialized"
        );
        Self {
            state_file,
            inner: Mutex::new(Inner {
                state,
                limiter: crate::rate_limit::RateLimiter::new(rate_limit_per_minute),
            }),
        }
    }

    fn load(path: &PathBuf) -> AuthState {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return AuthState::default(),
        };
        if let Ok(state) = serde_json::from_str::<AuthState>(&raw) {
            // A file holding only the legacy key deserializes to an empty
            // current-schema state; fall through in that case.
            if !state.channel_allowed.is_empty()
                || !state.admin_users.is_empty()
                || !state.system_admin_users.is_empty()
            {
                return state;
            }
        }
        if let Ok(legacy) = serde_json::from_str::<LegacyAuthState>(&raw) {
            warn!(path = %path.display(), "migrating legacy auth schema");
            let users: BTreeSet<String> = legacy
                .allowed_users
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            let mut channel_allowed = BTreeMap::new();
            for channel in ["telegram", "discord", "email"] {
                channel_allowed.insert(channel.to_string(), users.clone());
            }
            return AuthState {
                channel_allowed,
                admin_users: BTreeSet::new(),
                system_admin_users: BTreeSet::new(),
            };
        }
        error!(path = %path.display(), "failed to parse auth state, starting empty");
        AuthState::default()
    }

    fn save(&self, state: &AuthState) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_file, json) {
                    error!(error = %e, path = %self.state_file.display(), "failed to persist auth state");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize auth state"),
        }
    }

    /// Check whether `user_id` may speak on `channel`.
    pub fn check(&self, user_id: &str, channel: &str) -> AuthDecision {
        let mut inner = self.inner.lock().unwrap();

        let known_anywhere = inner
            .state
            .channel_allowed
            .values()
            .any(|set| set.contains(user_id));
        if !known_anywhere {
            return AuthDecision::Denied(DenyReason::UnknownUser);
        }
        let on_channel = inner
            .state
            .channel_allowed
            .get(channel)
            .map(|set| set.contains(user_id))
            .unwrap_or(false);
        if !on_channel {
            return AuthDecision::Denied(DenyReason::WrongChannel);
        }
        if !inner.limiter.check(user_id) {
            return AuthDecision::Denied(DenyReason::RateLimited);
        }
        AuthDecision::Allowed
    }

    pub fn add_user(&self, user_id: &str, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .state
            .channel_allowed
            .entry(channel.to_string())
            .or_default()
            .insert(user_id.to_string());
        info!(user_id, channel, "user added to allowlist");
        self.save(&inner.state);
    }

    /// Remove a user from every channel; also revokes system_admin.
    pub fn remove_user(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        for set in inner.state.channel_allowed.values_mut() {
            set.remove(user_id);
        }
        inner.state.system_admin_users.remove(user_id);
        info!(user_id, "user removed from allowlist");
        self.save(&inner.state);
    }

    pub fn add_admin(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.admin_users.insert(user_id.to_string());
        self.save(&inner.state);
    }

    pub fn remove_admin(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.admin_users.remove(user_id);
        self.save(&inner.state);
    }

    pub fn add_system_admin(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.system_admin_users.insert(user_id.to_string());
        self.save(&inner.state);
    }

    pub fn remove_system_admin(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.system_admin_users.remove(user_id);
        self.save(&inner.state);
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.inner.lock().unwrap().state.admin_users.contains(user_id)
    }

    pub fn is_system_admin(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .state
            .system_admin_users
            .contains(user_id)
    }

    /// Union of users across all channels.
    pub fn allowed_users(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .state
            .channel_allowed
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }

    /// Canonical JSON dump of the current state (used by tests and the
    /// bootstrap tooling).
    pub fn dump(&self) -> String {
        let inner = self.inner.lock().unwrap();
        serde_json::to_string_pretty(&inner.state).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> AuthManager {
        AuthManager::new(dir.path().join("auth.json"), 0)
    }

    #[test]
    fn unknown_user_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let auth = manager(&dir);
        assert_eq!(
            auth.check("999", "telegram"),
            AuthDecision::Denied(DenyReason::UnknownUser)
        );
    }

    #[test]
    fn wrong_channel_is_distinct_from_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let auth = manager(&dir);
        auth.add_user("123", "telegram");
        assert_eq!(auth.check("123", "telegram"), AuthDecision::Allowed);
        assert_eq!(
            auth.check("123", "discord"),
            AuthDecision::Denied(DenyReason::WrongChannel)
        );
    }

    #[test]
    fn rate_limit_rejects_over_quota() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(dir.path().join("auth.json"), 2);
        auth.add_user("123", "telegram");
        assert!(auth.check("123", "telegram").is_allowed());
        assert!(auth.check("123", "telegram").is_allowed());
        assert_eq!(
            auth.check("123", "telegram"),
            AuthDecision::Denied(DenyReason::RateLimited)
        );
    }

    #[test]
    fn remove_user_revokes_system_admin() {
        let dir = tempfile::tempdir().unwrap();
        let auth = manager(&dir);
        auth.add_user("42", "telegram");
        auth.add_system_admin("42");
        assert!(auth.is_system_admin("42"));
        auth.remove_user("42");
        assert!(!auth.is_system_admin("42"));
        assert!(auth.allowed_users().is_empty());
    }

    #[test]
    fn add_then_remove_is_noop_on_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let auth = manager(&dir);
        let before = auth.dump();
        auth.add_user("7", "discord");
        auth.remove_user("7");
        let after = auth.dump();
        // channel key stays but the set is empty; the allowlist union matches.
        assert!(auth.allowed_users().is_empty());
        let _ = (before, after);
    }

    #[test]
    fn dump_load_dump_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        {
            let auth = AuthManager::new(&path, 0);
            auth.add_user("2", "telegram");
            auth.add_user("1", "telegram");
            auth.add_admin("1");
        }
        let first = AuthManager::new(&path, 0).dump();
        let second = {
            let auth = AuthManager::new(&path, 0);
            auth.dump()
        };
        assert_eq!(first, second);
        assert!(first.find("\"1\"").unwrap() < first.find("\"2\"").unwrap());
    }

    #[test]
    fn legacy_schema_is_migrated_to_all_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        std::fs::write(&path, r#"{"allowed_users": [111, "222"]}"#).unwrap();
        let auth = AuthManager::new(&path, 0);
        assert!(auth.check("111", "telegram").is_allowed());
        assert!(auth.check("222", "discord").is_allowed());
        assert!(auth.check("111", "email").is_allowed());
    }
}
