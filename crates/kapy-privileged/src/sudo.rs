//! Per-chat sudo windows for the system-mode gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone)]
struct SudoWindow {
    created_at: f64,
    expires_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SudoStatus {
    pub enabled: bool,
    pub remaining_seconds: u64,
    pub expires_at: Option<f64>,
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Expiring `(user, channel, chat)` root-mode windows. Expired entries
/// are reaped lazily on every call.
pub struct SudoStateManager {
    ttl_seconds: u64,
    windows: Mutex<HashMap<String, SudoWindow>>,
}

impl SudoStateManager {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: ttl_seconds.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn key(user_id: &str, channel: &str, chat_id: &str) -> String {
        format!("{user_id}|{channel}|{chat_id}")
    }

    fn reap(windows: &mut HashMap<String, SudoWindow>, now: f64) {
        windows.retain(|_, w| w.expires_at > now);
    }

    /// Open (or refresh) a window; returns its effective TTL.
    pub fn enable(
        &self,
        user_id: &str,
        channel: &str,
        chat_id: &str,
        ttl_seconds: Option<u64>,
    ) -> SudoStatus {
        let now = now_secs();
        let ttl = ttl_seconds.unwrap_or(self.ttl_seconds).max(1);
        let mut windows = self.windows.lock().unwrap();
        Self::reap(&mut windows, now);
        let window = SudoWindow {
            created_at: now,
            expires_at: now + ttl as f64,
        };
        let expires_at = window.expires_at;
        windows.insert(Self::key(user_id, channel, chat_id), window);
        SudoStatus {
            enabled: true,
            remaining_seconds: ttl,
            expires_at: Some(expires_at),
        }
    }

    /// Close the window; true when one existed.
    pub fn disable(&self, user_id: &str, channel: &str, chat_id: &str) -> bool {
        let now = now_secs();
        let mut windows = self.windows.lock().unwrap();
        Self::reap(&mut windows, now);
        windows.remove(&Self::key(user_id, channel, chat_id)).is_some()
    }

    pub fn status(&self, user_id: &str, channel: &str, chat_id: &str) -> SudoStatus {
        let now = now_secs();
        let mut windows = self.windows.lock().unwrap();
        Self::reap(&mut windows, now);
        match windows.get(&Self::key(user_id, channel, chat_id)) {
            Some(w) => {
                let remaining = (w.expires_at - now).max(0.0) as u64;
                SudoStatus {
                    enabled: remaining > 0,
                    remaining_seconds: remaining,
                    expires_at: Some(w.expires_at),
                }
            }
            None => SudoStatus {
                enabled: false,
                remaining_seconds: 0,
                expires_at: None,
            },
        }
    }

    pub fn is_enabled(&self, user_id: &str, channel: &str, chat_id: &str) -> bool {
        self.status(user_id, channel, chat_id).enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_then_status_reports_remaining() {
        let sudo = SudoStateManager::new(600);
        let state = sudo.enable("u1", "telegram", "c1", None);
        assert!(state.enabled);
        assert_eq!(state.remaining_seconds, 600);
        assert!(sudo.is_enabled("u1", "telegram", "c1"));
    }

    #[test]
    fn windows_are_chat_scoped() {
        let sudo = SudoStateManager::new(600);
        sudo.enable("u1", "telegram", "c1", None);
        assert!(!sudo.is_enabled("u1", "telegram", "c2"));
        assert!(!sudo.is_enabled("u1", "discord", "c1"));
        assert!(!sudo.is_enabled("u2", "telegram", "c1"));
    }

    #[test]
    fn disable_reports_prior_presence() {
        let sudo = SudoStateManager::new(600);
        assert!(!sudo.disable("u1", "telegram", "c1"));
        sudo.enable("u1", "telegram", "c1", None);
        assert!(sudo.disable("u1", "telegram", "c1"));
        assert!(!sudo.is_enabled("u1", "telegram", "c1"));
    }

    #[test]
    fn ttl_floor_is_one_second() {
        let sudo = SudoStateManager::new(0);
        let state = sudo.enable("u1", "telegram", "c1", Some(0));
        assert_eq!(state.remaining_seconds, 1);
    }
}
