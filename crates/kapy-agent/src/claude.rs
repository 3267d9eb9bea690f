//! Claude Code adapter: one invocation per turn, whole stdout parsed as
//! a single JSON document.
//!
//! The first invocation in a session passes `--session-id`; subsequent
//! ones swap it for `--resume` so the binary restores its own context.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::adapter::{AgentAdapter, ChunkStream};
use crate::error::Result;
use crate::runner::{
    command_not_found_notice, exec_error_notice, timeout_notice, AgentShared,
};
use crate::types::{HealthReport, SendOptions, SessionInfo, UsageInfo};

pub struct ClaudeCodeAgent {
    shared: Arc<AgentShared>,
    /// Sessions that already ran their first invocation.
    resumed: Mutex<HashSet<String>>,
}

impl ClaudeCodeAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        config: kapy_core::config::AgentCliConfig,
        workspace_base: &std::path::Path,
        runtime_mode: &str,
        instance_id: &str,
        system_client: Option<Arc<kapy_privileged::SystemServiceClient>>,
        require_bridge: bool,
    ) -> Self {
        Self {
            shared: Arc::new(AgentShared::new(
                name,
                config,
                workspace_base,
                runtime_mode,
                instance_id,
                system_client,
                require_bridge,
            )),
            resumed: Mutex::new(HashSet::new()),
        }
    }

    fn finalize_args(&self, mut args: Vec<String>, session_id: &str, run_as_root: bool) -> Vec<String> {
        let resumed = self.resumed.lock().unwrap().contains(session_id);
        if resumed {
            for token in args.iter_mut() {
                if token == "--session-id" {
                    *token = "--resume".to_string();
                }
            }
        }
        if run_as_root && self.shared.in_system_mode() {
            args.push("--dangerously-skip-permissions".to_string());
            args.push("--permission-mode".to_string());
            args.push("bypassPermissions".to_string());
        }
        args
    }

    fn mark_resumed(&self, session_id: &str) {
        self.resumed.lock().unwrap().insert(session_id.to_string());
    }

    /// Parse the one-shot JSON document: the `result` string becomes the
    /// chunk, the remaining fields become the turn's usage record.
    fn parse_result(shared: &AgentShared, session_id: &str, stdout: &str) -> Option<String> {
        let doc: Value = match serde_json::from_str(stdout.trim()) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(session_id, error = %e, "claude output is not valid JSON, passing through raw");
                return Some(stdout.trim().to_string()).filter(|s| !s.is_empty());
            }
        };
        let result = doc
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let usage = UsageInfo {
            input_tokens: doc
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: doc
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_tokens: doc
                .pointer("/usage/cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_creation_tokens: doc
                .pointer("/usage/cache_creation_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cost_usd: doc
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            duration_ms: doc.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
            model: doc
                .get("modelUsage")
                .and_then(Value::as_object)
                .and_then(|m| m.keys().next().cloned())
                .unwrap_or_default(),
        };
        shared
            .last_usage
            .insert(session_id.to_string(), usage);

        Some(result).filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl AgentAdapter for ClaudeCodeAgent {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn create_session(
        &self,
        user_id: &str,
        chat_id: &str,
        session_id: Option<&str>,
    ) -> Result<SessionInfo> {
        self.shared.create_session(user_id, chat_id, session_id)
    }

    fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.shared.sessions.get(session_id).map(|s| s.clone())
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        opts: SendOptions,
    ) -> Result<ChunkStream> {
        let session = self.shared.get_session(session_id)?;
        let args = self.shared.build_args(
            message,
            session_id,
            opts.model.as_deref(),
            &opts.params,
        );
        let args = self.finalize_args(args, session_id, opts.run_as_root);
        self.mark_resumed(session_id);

        let shared = Arc::clone(&self.shared);
        let session_id = session_id.to_string();
        let cancel = shared.new_cancel_token(&session_id);

        // Remote bridge path: the daemon runs the binary and returns its
        // whole stdout in one response.
        if let Some(client) = shared.system_client.clone() {
            let stream = stream! {
                shared.mark_busy(&session_id, None);
                let response = shared.remote_exec(&client, &session, &shared.config.command.clone(), &args).await;
                if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                    let stdout = response.get("stdout").and_then(Value::as_str).unwrap_or("");
                    if let Some(chunk) = Self::parse_result(&shared, &session_id, stdout) {
                        yield chunk;
                    }
                    let returncode = response.get("returncode").and_then(Value::as_i64).unwrap_or(0);
                    if returncode != 0 {
                        yield format!("\n\n❌ Exit code: {returncode}");
                    }
                } else {
                    let reason = response.get("reason").and_then(Value::as_str).unwrap_or("unknown");
                    error!(reason, "remote claude execution failed");
                    yield exec_error_notice(reason);
                }
                shared.clear_busy(&session_id);
            };
            return Ok(Box::pin(stream));
        }

        if shared.require_bridge {
            let stream = stream! {
                yield "❌ system_client_required".to_string();
            };
            return Ok(Box::pin(stream));
        }

        let stream = stream! {
            let command = shared.config.command.clone();
            let timeout_secs = shared.config.timeout_seconds;
            debug!(command = %command, args = ?args, "executing claude CLI");

            let mut cmd = Command::new(&command);
            cmd.args(&args)
                .current_dir(&session.work_dir)
                .envs(shared.child_env())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true);

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let notice = command_not_found_notice("Claude Code", &command);
                    error!("{notice}");
                    yield notice;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to spawn claude CLI");
                    yield exec_error_notice(&e.to_string());
                    return;
                }
            };
            shared.mark_busy(&session_id, child.id());

            let waited = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(session_id = %session_id, "claude turn cancelled");
                    shared.clear_busy(&session_id);
                    return;
                }
                waited = tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    child.wait_with_output(),
                ) => waited,
            };

            match waited {
                Ok(Ok(output)) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    if let Some(chunk) = Self::parse_result(&shared, &session_id, &stdout) {
                        yield chunk;
                    }
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !stderr.trim().is_empty() {
                        warn!(session_id = %session_id, stderr = %stderr.trim(), "claude CLI stderr");
                    }
                    if !output.status.success() {
                        let code = output.status.code().unwrap_or(-1);
                        yield format!("\n\n❌ Exit code: {code}");
                        if !stderr.trim().is_empty() {
                            yield format!("\nError: {}", stderr.trim());
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!(error = %e, "claude CLI process error");
                    yield exec_error_notice(&e.to_string());
                }
                Err(_) => {
                    // wait_with_output consumed the child; kill_on_drop
                    // already reaped it when the timeout fired.
                    error!(session_id = %session_id, timeout_secs, "claude CLI timed out");
                    yield timeout_notice(timeout_secs);
                }
            }
            shared.clear_busy(&session_id);
        };
        Ok(Box::pin(stream))
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.shared.kill_active(session_id).await;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<()> {
        self.shared.kill_active(session_id).await;
        self.shared.destroy(session_id)?;
        self.resumed.lock().unwrap().remove(session_id);
        Ok(())
    }

    fn health_check(&self, session_id: &str) -> HealthReport {
        self.shared.health_check(session_id)
    }

    fn get_last_usage(&self, session_id: &str) -> Option<UsageInfo> {
        self.shared.pop_last_usage(session_id)
    }

    fn is_process_alive(&self, session_id: &str) -> bool {
        self.shared.is_process_alive(session_id)
    }

    async fn kill_process(&self, session_id: &str) {
        self.shared.kill_active(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn agent(dir: &tempfile::TempDir) -> ClaudeCodeAgent {
        agent_with_command(dir, "/bin/echo")
    }

    fn agent_with_command(dir: &tempfile::TempDir, command: &str) -> ClaudeCodeAgent {
        let config = kapy_core::config::AgentCliConfig {
            command: command.to_string(),
            kind: kapy_core::config::AgentKind::Claude,
            args_template: vec![
                "-p".into(),
                "{prompt}".into(),
                "--session-id".into(),
                "{session_id}".into(),
            ],
            models: HashMap::from([("opus".to_string(), "claude-opus-4-6".to_string())]),
            supported_params: HashMap::from([
                ("model".to_string(), "--model".to_string()),
                ("thinking".to_string(), "--thinking".to_string()),
            ]),
            default_model: Some("opus".into()),
            default_params: HashMap::new(),
            timeout_seconds: 10,
            env: HashMap::new(),
        };
        ClaudeCodeAgent::new(
            "claude",
            config,
            dir.path(),
            "session",
            "user-main",
            None,
            false,
        )
    }

    #[tokio::test]
    async fn create_session_builds_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let a = agent(&dir);
        let info = a.create_session("u1", "c1", None).await.unwrap();
        assert!(info.work_dir.join("user").is_dir());
        assert!(info.work_dir.join("ai").is_dir());
        assert!(a.get_session_info(&info.session_id).is_some());
    }

    #[tokio::test]
    async fn unknown_session_fails_send() {
        let dir = tempfile::tempdir().unwrap();
        let a = agent(&dir);
        let result = a
            .send_message("deadbeef", "hi", SendOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(crate::error::AgentError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn first_call_uses_session_id_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let a = agent(&dir);
        let base = a
            .shared
            .build_args("hi", "aabbccdd", None, &HashMap::new());

        let first = a.finalize_args(base.clone(), "aabbccdd", false);
        assert!(first.contains(&"--session-id".to_string()));
        assert!(!first.contains(&"--resume".to_string()));

        a.mark_resumed("aabbccdd");
        let second = a.finalize_args(base, "aabbccdd", false);
        assert!(second.contains(&"--resume".to_string()));
        assert!(!second.contains(&"--session-id".to_string()));
    }

    #[test]
    fn root_flags_require_system_mode() {
        let dir = tempfile::tempdir().unwrap();
        let a = agent(&dir);
        let args = a.finalize_args(vec![], "aabbccdd", true);
        // Session mode: no bypass flags.
        assert!(args.is_empty());
    }

    #[test]
    fn root_flags_appended_in_system_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = kapy_core::config::AgentCliConfig {
            command: "claude".into(),
            kind: kapy_core::config::AgentKind::Claude,
            args_template: vec![],
            models: HashMap::new(),
            supported_params: HashMap::new(),
            default_model: None,
            default_params: HashMap::new(),
            timeout_seconds: 10,
            env: HashMap::new(),
        };
        let a = ClaudeCodeAgent::new("claude", config, dir.path(), "system", "ops-a", None, false);
        let args = a.finalize_args(vec![], "aabbccdd", true);
        let joined = args.join(" ");
        assert!(joined.contains("--dangerously-skip-permissions"));
        assert!(joined.contains("--permission-mode bypassPermissions"));
    }

    #[test]
    fn parse_result_extracts_chunk_and_usage() {
        let dir = tempfile::tempdir().unwrap();
        let a = agent(&dir);
        let doc = serde_json::json!({
            "result": "Hi",
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 2},
            "total_cost_usd": 0.002,
            "duration_ms": 500,
            "modelUsage": {"claude-opus-4-6": {}},
        })
        .to_string();
        let chunk = ClaudeCodeAgent::parse_result(&a.shared, "aabbccdd", &doc).unwrap();
        assert_eq!(chunk, "Hi");
        let usage = a.shared.pop_last_usage("aabbccdd").unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.cache_read_tokens, 2);
        assert_eq!(usage.cost_usd, 0.002);
        assert_eq!(usage.duration_ms, 500);
        assert_eq!(usage.model, "claude-opus-4-6");
    }

    #[tokio::test]
    async fn missing_binary_yields_localized_notice() {
        use futures_util::StreamExt;
        let dir = tempfile::tempdir().unwrap();
        let a = agent_with_command(&dir, "/nonexistent/claude-binary");
        let info = a.create_session("u1", "c1", None).await.unwrap();
        let mut stream = a
            .send_message(&info.session_id, "hi", SendOptions::default())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        assert!(chunks.iter().any(|c| c.contains("未安装或未找到命令")));
        assert!(!a.get_session_info(&info.session_id).unwrap().is_busy);
    }
}
