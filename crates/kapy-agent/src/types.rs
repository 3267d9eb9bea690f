use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime adjunct to a managed session, owned by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_name: String,
    pub user_id: String,
    pub chat_id: String,
    pub work_dir: PathBuf,
    pub created_at: f64,
    pub last_active: f64,
    /// Pid of the in-flight child, if any.
    pub pid: Option<u32>,
    /// True only while the adapter holds a live child process.
    pub is_busy: bool,
}

/// Per-turn cost record reported by the agent binary. Popped once per turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub alive: bool,
    pub pid: Option<u32>,
    pub memory_mb: f64,
    pub busy: bool,
    pub pending_seconds: Option<f64>,
}

impl HealthReport {
    pub fn dead() -> Self {
        Self {
            alive: false,
            pid: None,
            memory_mb: 0.0,
            busy: false,
            pending_seconds: None,
        }
    }
}

/// Options for one `send_message` invocation.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model: Option<String>,
    pub params: HashMap<String, String>,
    /// Upgrade the invocation to the root-capable flag profile
    /// (honored only in system mode).
    pub run_as_root: bool,
}

pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
