//! Shared subprocess/session machinery embedded by both adapter shapes.
//!
//! Expressed as a composed value (`AgentShared`) rather than a base
//! class: each adapter embeds it and layers its own argument finalization
//! and output handling on top.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kapy_core::config::AgentCliConfig;
use kapy_privileged::SystemServiceClient;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::types::{now_secs, HealthReport, SessionInfo, UsageInfo};
use crate::workspace;

/// Localized chunk for a wall-clock timeout.
pub fn timeout_notice(timeout_secs: u64) -> String {
    format!("⚠️ 操作超时（{timeout_secs}秒）")
}

/// Localized chunk for a timeout that may have truncated output.
pub fn truncated_timeout_notice(timeout_secs: u64) -> String {
    format!("⚠️ 操作超时（{timeout_secs}秒），结果可能不完整")
}

/// Localized chunk for a missing binary.
pub fn command_not_found_notice(label: &str, command: &str) -> String {
    format!("❌ {label} CLI 未安装或未找到命令: {command}")
}

/// Localized chunk for a generic execution error.
pub fn exec_error_notice(err: &str) -> String {
    format!("❌ 执行错误: {err}")
}

/// State shared by every adapter shape: session registry, usage records,
/// cancellation, and the optional privileged bridge.
pub struct AgentShared {
    pub name: String,
    pub config: AgentCliConfig,
    pub runtime_mode: String,
    pub instance_id: String,
    /// Per-agent workspace parent (`<base>/<agent-name>`).
    pub workspace_base: PathBuf,
    pub sessions: DashMap<String, SessionInfo>,
    pub last_usage: DashMap<String, UsageInfo>,
    pub cancel_tokens: DashMap<String, CancellationToken>,
    pub active_pids: DashMap<String, u32>,
    pub system_client: Option<Arc<SystemServiceClient>>,
    /// When true, invocations must go through the daemon (fail closed).
    pub require_bridge: bool,
}

impl AgentShared {
    pub fn new(
        name: &str,
        config: AgentCliConfig,
        workspace_base: &std::path::Path,
        runtime_mode: &str,
        instance_id: &str,
        system_client: Option<Arc<SystemServiceClient>>,
        require_bridge: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            runtime_mode: runtime_mode.to_string(),
            instance_id: instance_id.to_string(),
            workspace_base: workspace_base.join(name),
            sessions: DashMap::new(),
            last_usage: DashMap::new(),
            cancel_tokens: DashMap::new(),
            active_pids: DashMap::new(),
            system_client,
            require_bridge,
        }
    }

    pub fn in_system_mode(&self) -> bool {
        kapy_core::runtime::is_system_mode(&self.runtime_mode)
    }

    /// Create or return a session, initializing the workspace tree.
    pub fn create_session(
        &self,
        user_id: &str,
        chat_id: &str,
        session_id: Option<&str>,
    ) -> Result<SessionInfo> {
        if let Some(sid) = session_id {
            if let Some(mut existing) = self.sessions.get_mut(sid) {
                existing.last_active = now_secs();
                return Ok(existing.clone());
            }
        }
        // Adapter-generated ids follow the gateway's 8-hex convention so
        // the managed session can adopt them directly.
        let sid = session_id.map(|s| s.to_string()).unwrap_or_else(|| {
            use rand::RngCore;
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        });
        let work_dir = self.workspace_base.join(format!("sess_{sid}"));
        workspace::init_workspace(&work_dir)?;

        let now = now_secs();
        let session = SessionInfo {
            session_id: sid.clone(),
            agent_name: self.name.clone(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            work_dir,
            created_at: now,
            last_active: now,
            pid: None,
            is_busy: false,
        };
        self.sessions.insert(sid.clone(), session.clone());
        info!(agent = %self.name, session_id = %sid, work_dir = %session.work_dir.display(), "created agent session");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| AgentError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    pub fn mark_busy(&self, session_id: &str, pid: Option<u32>) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.is_busy = true;
            s.pid = pid;
            s.last_active = now_secs();
        }
        if let Some(pid) = pid {
            self.active_pids.insert(session_id.to_string(), pid);
        }
    }

    pub fn clear_busy(&self, session_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.is_busy = false;
            s.pid = None;
            s.last_active = now_secs();
        }
        self.active_pids.remove(session_id);
    }

    /// Fresh cancellation token for a new turn, replacing any stale one.
    pub fn new_cancel_token(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens
            .insert(session_id.to_string(), token.clone());
        token
    }

    /// Substitute the prompt/session placeholders and attach model/param
    /// flags from the typed config.
    pub fn build_args(
        &self,
        message: &str,
        session_id: &str,
        model: Option<&str>,
        params: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut args: Vec<String> = self
            .config
            .args_template
            .iter()
            .map(|arg| {
                arg.replace("{prompt}", message)
                    .replace("{session_id}", session_id)
            })
            .collect();

        if let Some(alias) = model {
            if let Some(flag) = self.config.supported_params.get("model") {
                let full = self
                    .config
                    .models
                    .get(alias)
                    .cloned()
                    .unwrap_or_else(|| alias.to_string());
                args.push(flag.clone());
                args.push(full);
            }
        }
        for (key, value) in params {
            if key == "model" {
                continue;
            }
            if let Some(flag) = self.config.supported_params.get(key) {
                args.push(flag.clone());
                args.push(value.clone());
            }
        }
        args
    }

    /// SIGTERM the session's child, escalating to SIGKILL after 3s.
    pub async fn kill_active(&self, session_id: &str) {
        if let Some(token) = self.cancel_tokens.get(session_id) {
            token.cancel();
        }
        let pid = match self.active_pids.get(session_id) {
            Some(pid) => *pid,
            None => {
                self.clear_busy(session_id);
                return;
            }
        };
        signal_pid(pid, libc::SIGTERM);
        for _ in 0..30 {
            if !pid_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if pid_alive(pid) {
            warn!(agent = %self.name, session_id, pid, "child ignored SIGTERM, sending SIGKILL");
            signal_pid(pid, libc::SIGKILL);
        }
        self.clear_busy(session_id);
    }

    pub fn is_process_alive(&self, session_id: &str) -> bool {
        self.active_pids
            .get(session_id)
            .map(|pid| pid_alive(*pid))
            .unwrap_or(false)
    }

    pub fn health_check(&self, session_id: &str) -> HealthReport {
        match self.sessions.get(session_id) {
            Some(s) => HealthReport {
                alive: true,
                pid: s.pid,
                memory_mb: 0.0,
                busy: s.is_busy,
                pending_seconds: if s.is_busy {
                    Some(now_secs() - s.last_active)
                } else {
                    None
                },
            },
            None => HealthReport::dead(),
        }
    }

    pub fn pop_last_usage(&self, session_id: &str) -> Option<UsageInfo> {
        self.last_usage.remove(session_id).map(|(_, usage)| usage)
    }

    pub fn destroy(&self, session_id: &str) -> Result<SessionInfo> {
        let (_, session) =
            self.sessions
                .remove(session_id)
                .ok_or_else(|| AgentError::SessionNotFound {
                    id: session_id.to_string(),
                })?;
        self.cancel_tokens.remove(session_id);
        self.active_pids.remove(session_id);
        self.last_usage.remove(session_id);
        info!(agent = %self.name, session_id, work_dir = %session.work_dir.display(),
            "destroyed session (workspace retained)");
        Ok(session)
    }

    /// Child environment: inherited process env overlaid with config env.
    pub fn child_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (k, v) in &self.config.env {
            env.insert(k.clone(), v.clone());
        }
        env
    }

    /// Forward one invocation to the privileged daemon as an
    /// `agent_cli_exec` action.
    pub async fn remote_exec(
        &self,
        client: &SystemServiceClient,
        session: &SessionInfo,
        command: &str,
        args: &[String],
    ) -> serde_json::Value {
        let action = json!({
            "op": "agent_cli_exec",
            "agent": self.name,
            "mode": if self.in_system_mode() { "system" } else { "session" },
            "instance_id": self.instance_id,
            "command": command,
            "args": args,
            "cwd": session.work_dir.to_string_lossy(),
            "env": self.config.env,
            "timeout_seconds": self.config.timeout_seconds,
        });
        client.execute(&session.user_id, &action, None).await
    }
}

pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs permission/existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn signal_pid(pid: u32, signal: libc::c_int) {
    // Negative pid targets the process group the child leads.
    // SAFETY: sending a signal to a dead pid is harmless (ESRCH).
    unsafe {
        if libc::kill(-(pid as libc::pid_t), signal) != 0 {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(dir: &tempfile::TempDir) -> AgentShared {
        let config = AgentCliConfig {
            command: "codex".into(),
            kind: kapy_core::config::AgentKind::Codex,
            args_template: vec!["exec".into(), "{prompt}".into()],
            models: HashMap::from([("gpt".to_string(), "gpt-5.3-codex".to_string())]),
            supported_params: HashMap::from([
                ("model".to_string(), "--model".to_string()),
                ("effort".to_string(), "--effort".to_string()),
            ]),
            default_model: None,
            default_params: HashMap::new(),
            timeout_seconds: 300,
            env: HashMap::new(),
        };
        AgentShared::new(
            "codex",
            config,
            dir.path(),
            "session",
            "user-main",
            None,
            false,
        )
    }

    #[test]
    fn create_session_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        let a = s.create_session("u1", "c1", Some("aabbccdd")).unwrap();
        let b = s.create_session("u1", "c1", Some("aabbccdd")).unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.work_dir, b.work_dir);
        assert!(b.last_active >= a.last_active);
        assert!(a.work_dir.join("user").is_dir());
        assert!(a.work_dir.join("ai").is_dir());
        assert!(a.work_dir.join("system/temp").is_dir());
    }

    #[test]
    fn build_args_substitutes_and_maps_model_alias() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        let args = s.build_args(
            "hello world",
            "aabbccdd",
            Some("gpt"),
            &HashMap::from([("effort".to_string(), "high".to_string())]),
        );
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "hello world");
        let joined = args.join(" ");
        assert!(joined.contains("--model gpt-5.3-codex"));
        assert!(joined.contains("--effort high"));
    }

    #[test]
    fn unsupported_params_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        let args = s.build_args(
            "hi",
            "aabbccdd",
            None,
            &HashMap::from([("bogus".to_string(), "x".to_string())]),
        );
        assert!(!args.join(" ").contains("bogus"));
    }

    #[test]
    fn busy_flag_follows_mark_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        let a = s.create_session("u1", "c1", Some("aabbccdd")).unwrap();
        s.mark_busy(&a.session_id, Some(12345));
        assert!(s.get_session(&a.session_id).unwrap().is_busy);
        s.clear_busy(&a.session_id);
        let after = s.get_session(&a.session_id).unwrap();
        assert!(!after.is_busy);
        assert!(after.pid.is_none());
    }

    #[test]
    fn usage_pops_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        s.last_usage.insert(
            "aabbccdd".to_string(),
            UsageInfo {
                cost_usd: 0.002,
                ..Default::default()
            },
        );
        assert!(s.pop_last_usage("aabbccdd").is_some());
        assert!(s.pop_last_usage("aabbccdd").is_none());
    }

    #[test]
    fn destroy_unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let s = shared(&dir);
        assert!(matches!(
            s.destroy("deadbeef"),
            Err(AgentError::SessionNotFound { .. })
        ));
    }
}
