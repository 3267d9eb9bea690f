use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One turn in a session's in-memory conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

/// Persisted session metadata.
///
/// Timestamps are Unix seconds (float) so the state file stays directly
/// comparable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedSession {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    /// Scope the session is pinned to (`channel:dm:user` / `channel:chat:chat`).
    pub scope_id: String,
    pub agent_name: String,
    pub created_at: f64,
    pub last_active: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Optional human label set via `/name`.
    #[serde(default)]
    pub name: Option<String>,
    /// Bounded turn log; not part of the durability contract.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl ManagedSession {
    pub fn touch(&mut self, now: f64) {
        self.last_active = now;
    }
}
