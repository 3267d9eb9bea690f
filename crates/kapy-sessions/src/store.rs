//! Persisted session store with per-user and per-scope active pointers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::{HistoryEntry, ManagedSession};

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// On-disk snapshot shape; every mutation rewrites the whole file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    #[serde(default)]
    active_by_user: HashMap<String, String>,
    #[serde(default)]
    active_by_scope: HashMap<String, String>,
    #[serde(default)]
    sessions: HashMap<String, ManagedSession>,
}

pub struct SessionStore {
    state_file: PathBuf,
    max_sessions_per_user: usize,
    state: Mutex<SessionState>,
}

impl SessionStore {
    pub fn new(state_file: impl Into<PathBuf>, max_sessions_per_user: usize) -> Self {
        let state_file = state_file.into();
        let state = Self::load(&state_file);
        info!(sessions = state.sessions.len(), "session store loaded");
        Self {
            state_file,
            max_sessions_per_user: max_sessions_per_user.max(1),
            state: Mutex::new(state),
        }
    }

    fn load(path: &PathBuf) -> SessionState {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "failed to parse session state, starting empty");
                    SessionState::default()
                }
            },
            Err(_) => SessionState::default(),
        }
    }

    fn save(&self, state: &SessionState) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_file, json) {
                    error!(error = %e, path = %self.state_file.display(), "failed to persist session state");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize session state"),
        }
    }

    /// Create and activate a session for `(user, scope)`. Evicts the
    /// user's oldest session when over the per-user cap.
    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        user_id: &str,
        chat_id: &str,
        scope_id: &str,
        agent_name: &str,
        session_id: Option<String>,
        model: Option<String>,
        params: HashMap<String, String>,
    ) -> ManagedSession {
        let sid = session_id.unwrap_or_else(crate::id::generate_session_id);
        let now = now_secs();
        let session = ManagedSession {
            session_id: sid.clone(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            scope_id: scope_id.to_string(),
            agent_name: agent_name.to_string(),
            created_at: now,
            last_active: now,
            model,
            params,
            name: None,
            history: Vec::new(),
        };

        let mut state = self.state.lock().unwrap();
        state.sessions.insert(sid.clone(), session.clone());
        state
            .active_by_user
            .insert(user_id.to_string(), sid.clone());
        state
            .active_by_scope
            .insert(scope_id.to_string(), sid.clone());

        self.evict_over_cap(&mut state, user_id, &sid);
        self.save(&state);
        session
    }

    /// Drop the user's oldest sessions (by `last_active`) beyond the cap,
    /// never evicting the session that was just created.
    fn evict_over_cap(&self, state: &mut SessionState, user_id: &str, keep: &str) {
        let owned = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .count();
        if owned <= self.max_sessions_per_user {
            return;
        }
        let mut candidates: Vec<(String, f64)> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.session_id != keep)
            .map(|s| (s.session_id.clone(), s.last_active))
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let excess = owned - self.max_sessions_per_user;
        for (sid, _) in candidates.into_iter().take(excess) {
            warn!(session_id = %sid, user_id, "evicting oldest session over per-user cap");
            Self::remove_session(state, &sid);
        }
    }

    fn remove_session(state: &mut SessionState, session_id: &str) -> Option<ManagedSession> {
        let session = state.sessions.remove(session_id)?;
        state
            .active_by_user
            .retain(|_, active| active != session_id);
        state
            .active_by_scope
            .retain(|_, active| active != session_id);
        Some(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<ManagedSession> {
        self.state.lock().unwrap().sessions.get(session_id).cloned()
    }

    pub fn list_user_sessions(&self, user_id: &str) -> Vec<ManagedSession> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.last_active
                .partial_cmp(&a.last_active)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    pub fn list_scope_sessions(&self, scope_id: &str) -> Vec<ManagedSession> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.scope_id == scope_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.last_active
                .partial_cmp(&a.last_active)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    pub fn get_active_session(&self, user_id: &str) -> Option<ManagedSession> {
        let state = self.state.lock().unwrap();
        let sid = state.active_by_user.get(user_id)?;
        state.sessions.get(sid).cloned()
    }

    pub fn get_active_session_for_scope(&self, scope_id: &str) -> Option<ManagedSession> {
        let state = self.state.lock().unwrap();
        let sid = state.active_by_scope.get(scope_id)?;
        state.sessions.get(sid).cloned()
    }

    /// Switch the user's active pointer; rejects sessions owned by others.
    pub fn switch_session(&self, user_id: &str, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let ok = match state.sessions.get_mut(session_id) {
            Some(s) if s.user_id == user_id => {
                s.last_active = now_secs();
                true
            }
            _ => false,
        };
        if ok {
            state
                .active_by_user
                .insert(user_id.to_string(), session_id.to_string());
            self.save(&state);
        }
        ok
    }

    /// Switch the scope's active pointer; rejects sessions from other scopes.
    pub fn switch_session_for_scope(&self, scope_id: &str, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let user = match state.sessions.get_mut(session_id) {
            Some(s) if s.scope_id == scope_id => {
                s.last_active = now_secs();
                Some(s.user_id.clone())
            }
            _ => None,
        };
        match user {
            Some(user_id) => {
                state
                    .active_by_scope
                    .insert(scope_id.to_string(), session_id.to_string());
                state
                    .active_by_user
                    .insert(user_id, session_id.to_string());
                self.save(&state);
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.get_mut(session_id) {
            s.last_active = now_secs();
            self.save(&state);
        }
    }

    pub fn update_model(&self, session_id: &str, model: Option<String>) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sessions.get_mut(session_id) {
            Some(s) => {
                s.model = model;
                s.last_active = now_secs();
                self.save(&state);
                true
            }
            None => false,
        }
    }

    pub fn update_param(&self, session_id: &str, key: &str, value: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sessions.get_mut(session_id) {
            Some(s) => {
                s.params.insert(key.to_string(), value.to_string());
                s.last_active = now_secs();
                self.save(&state);
                true
            }
            None => false,
        }
    }

    pub fn reset_params(&self, session_id: &str, defaults: HashMap<String, String>) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sessions.get_mut(session_id) {
            Some(s) => {
                s.params = defaults;
                s.last_active = now_secs();
                self.save(&state);
                true
            }
            None => false,
        }
    }

    pub fn update_name(&self, session_id: &str, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sessions.get_mut(session_id) {
            Some(s) => {
                s.name = Some(name.to_string());
                s.last_active = now_secs();
                self.save(&state);
                true
            }
            None => false,
        }
    }

    /// Append a history entry, trimming to `max_entries`. History is kept
    /// in memory only unless `persist` is set.
    pub fn add_history(&self, session_id: &str, role: &str, content: &str, max_entries: usize, persist: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.get_mut(session_id) {
            s.history.push(HistoryEntry {
                role: role.to_string(),
                content: content.to_string(),
            });
            let len = s.history.len();
            if len > max_entries {
                s.history.drain(..len - max_entries);
            }
            if persist {
                self.save(&state);
            }
        }
    }

    pub fn get_history(&self, session_id: &str) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn destroy_session(&self, session_id: &str) -> Option<ManagedSession> {
        let mut state = self.state.lock().unwrap();
        let session = Self::remove_session(&mut state, session_id)?;
        self.save(&state);
        Some(session)
    }

    /// Remove sessions idle longer than `hours`. 0 disables cleanup.
    /// Returns the removed session ids.
    pub fn cleanup_inactive_sessions(&self, hours: u64) -> Vec<String> {
        if hours == 0 {
            return Vec::new();
        }
        let cutoff = now_secs() - (hours as f64) * 3600.0;
        let mut state = self.state.lock().unwrap();
        let stale: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.last_active < cutoff)
            .map(|s| s.session_id.clone())
            .collect();
        for sid in &stale {
            Self::remove_session(&mut state, sid);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "removed stale sessions");
            self.save(&state);
        }
        stale
    }
}
