//! Line-streaming adapter for Codex-/Gemini-family binaries.
//!
//! One subprocess per turn; stdout is decoded line by line (1 s poll so
//! wall-clock and cancellation checks stay responsive), stderr is read in
//! the background. Flag profiles per family finalize the argument list,
//! including the system-mode root rewriting.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use kapy_core::config::AgentKind;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::adapter::{AgentAdapter, ChunkStream};
use crate::error::Result;
use crate::runner::{
    command_not_found_notice, exec_error_notice, truncated_timeout_notice, AgentShared,
};
use crate::types::{HealthReport, SendOptions, SessionInfo, UsageInfo};

const SKIP_GIT_REPO_CHECK: &str = "--skip-git-repo-check";
const CODEX_FULL_AUTO: &str = "--full-auto";
const CODEX_BYPASS: &str = "--dangerously-bypass-approvals-and-sandbox";
const GEMINI_APPROVAL_MODE: &str = "--approval-mode";
const GEMINI_APPROVAL_MODE_PREFIX: &str = "--approval-mode=";
const GEMINI_APPROVAL_YOLO: &str = "--approval-mode=yolo";
const GEMINI_SANDBOX_FALSE: &str = "--sandbox=false";

pub struct StreamingCliAgent {
    shared: Arc<AgentShared>,
    label: &'static str,
}

impl StreamingCliAgent {
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
        let label = match config.kind {
            AgentKind::Gemini => "Gemini",
            _ => "Codex",
        };
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
            label,
        }
    }

    /// Apply the family-specific flag profile, including the root-mode
    /// rewrite (system mode only).
    fn finalize_args(&self, args: Vec<String>, run_as_root: bool) -> Vec<String> {
        let root = run_as_root && self.shared.in_system_mode();
        match self.shared.config.kind {
            AgentKind::Gemini => finalize_gemini_args(args, root),
            _ => finalize_codex_args(args, root),
        }
    }
}

fn finalize_codex_args(mut args: Vec<String>, run_as_root: bool) -> Vec<String> {
    if !args.iter().any(|a| a == SKIP_GIT_REPO_CHECK) {
        args.push(SKIP_GIT_REPO_CHECK.to_string());
    }
    if run_as_root {
        for token in args.iter_mut() {
            if token == CODEX_FULL_AUTO {
                *token = CODEX_BYPASS.to_string();
            }
        }
    }
    args
}

fn finalize_gemini_args(args: Vec<String>, run_as_root: bool) -> Vec<String> {
    if !run_as_root {
        return args;
    }
    let mut normalized: Vec<String> = Vec::with_capacity(args.len() + 2);
    let mut iter = args.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token == GEMINI_APPROVAL_MODE || token == "--sandbox" {
            // Flag takes a value; drop both.
            iter.next();
            continue;
        }
        if token.starts_with(GEMINI_APPROVAL_MODE_PREFIX)
            || token.starts_with("--sandbox=")
            || token == "--yolo"
            || token == "-y"
        {
            continue;
        }
        normalized.push(token);
    }
    normalized.push(GEMINI_APPROVAL_YOLO.to_string());
    normalized.push(GEMINI_SANDBOX_FALSE.to_string());
    normalized
}

#[async_trait]
impl AgentAdapter for StreamingCliAgent {
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
        let args = self.finalize_args(args, opts.run_as_root);

        let shared = Arc::clone(&self.shared);
        let label = self.label;
        let session_id = session_id.to_string();
        let cancel = shared.new_cancel_token(&session_id);

        // Remote bridge: the daemon returns streaming frames when it can,
        // otherwise one buffered {stdout, stderr, returncode} response.
        if let Some(client) = shared.system_client.clone() {
            let stream = stream! {
                shared.mark_busy(&session_id, None);
                let command = shared.config.command.clone();
                let response = shared.remote_exec(&client, &session, &command, &args).await;
                if let Some(frames) = response.get("frames").and_then(Value::as_array) {
                    for frame in frames {
                        let event = frame.get("event").and_then(Value::as_str).unwrap_or("");
                        if event == "done" {
                            break;
                        }
                        if event == "chunk"
                            && frame.get("stream").and_then(Value::as_str) == Some("stdout")
                        {
                            if let Some(data) = frame.get("data").and_then(Value::as_str) {
                                yield data.to_string();
                            }
                        }
                    }
                } else if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                    let stdout = response.get("stdout").and_then(Value::as_str).unwrap_or("");
                    for line in stdout.lines() {
                        yield format!("{line}\n");
                    }
                    let returncode = response.get("returncode").and_then(Value::as_i64).unwrap_or(0);
                    if returncode != 0 {
                        yield format!("\n\n❌ Exit code: {returncode}");
                    }
                } else {
                    let reason = response.get("reason").and_then(Value::as_str).unwrap_or("unknown");
                    error!(reason, "remote {label} execution failed");
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
            debug!(command = %command, args = ?args, "executing {label} CLI");

            let mut cmd = Command::new(&command);
            cmd.args(&args)
                .current_dir(&session.work_dir)
                .envs(shared.child_env())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let notice = command_not_found_notice(label, &command);
                    error!("{notice}");
                    yield notice;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to spawn {label} CLI");
                    yield exec_error_notice(&e.to_string());
                    return;
                }
            };
            shared.mark_busy(&session_id, child.id());

            let stdout = child.stdout.take();
            let mut stderr = child.stderr.take();
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(err) = stderr.as_mut() {
                    let _ = err.read_to_end(&mut buf).await;
                }
                String::from_utf8_lossy(&buf).into_owned()
            });

            let mut lines = stdout.map(|out| BufReader::new(out).lines());
            let started = Instant::now();
            let mut timed_out = false;
            let mut cancelled = false;

            'read: loop {
                if started.elapsed() > Duration::from_secs(timeout_secs) {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    timed_out = true;
                    yield truncated_timeout_notice(timeout_secs);
                    break 'read;
                }
                if cancel.is_cancelled() {
                    cancelled = true;
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    info!(session_id = %session_id, "{label} turn cancelled");
                    break 'read;
                }
                let Some(reader) = lines.as_mut() else { break 'read };
                // 1s poll keeps the timeout/cancel checks live even when
                // the child is silent.
                match tokio::time::timeout(Duration::from_secs(1), reader.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        yield format!("{line}\n");
                    }
                    Ok(Ok(None)) => break 'read,
                    Ok(Err(e)) => {
                        warn!(error = %e, "{label} stdout read failed");
                        break 'read;
                    }
                    Err(_) => {
                        if let Ok(Some(_)) = child.try_wait() {
                            break 'read;
                        }
                    }
                }
            }

            let status = if timed_out || cancelled {
                None
            } else {
                child.wait().await.ok()
            };

            let stderr_text = match tokio::time::timeout(Duration::from_secs(1), stderr_task).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            if !stderr_text.trim().is_empty() {
                warn!(session_id = %session_id, stderr = %stderr_text.trim(), "{label} stderr");
            }
            if let Some(status) = status {
                if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    yield format!("\n\n❌ Exit code: {code}");
                    if !stderr_text.trim().is_empty() {
                        yield format!("\nError: {}", stderr_text.trim());
                    }
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
    use futures_util::StreamExt;
    use std::collections::HashMap;

    fn config(kind: AgentKind, command: &str, args: Vec<&str>) -> kapy_core::config::AgentCliConfig {
        kapy_core::config::AgentCliConfig {
            command: command.to_string(),
            kind,
            args_template: args.into_iter().map(|s| s.to_string()).collect(),
            models: HashMap::new(),
            supported_params: HashMap::new(),
            default_model: None,
            default_params: HashMap::new(),
            timeout_seconds: 10,
            env: HashMap::new(),
        }
    }

    fn codex_agent(dir: &tempfile::TempDir, mode: &str) -> StreamingCliAgent {
        StreamingCliAgent::new(
            "codex",
            config(AgentKind::Codex, "/bin/echo", vec!["{prompt}"]),
            dir.path(),
            mode,
            "user-main",
            None,
            false,
        )
    }

    #[test]
    fn codex_appends_skip_git_repo_check_once() {
        let args = finalize_codex_args(vec!["exec".into()], false);
        assert_eq!(args, vec!["exec", SKIP_GIT_REPO_CHECK]);
        let args = finalize_codex_args(args, false);
        assert_eq!(
            args.iter().filter(|a| *a == SKIP_GIT_REPO_CHECK).count(),
            1
        );
    }

    #[test]
    fn codex_root_rewrites_full_auto() {
        let args = finalize_codex_args(vec!["exec".into(), CODEX_FULL_AUTO.into()], true);
        assert!(args.contains(&CODEX_BYPASS.to_string()));
        assert!(!args.contains(&CODEX_FULL_AUTO.to_string()));
    }

    #[test]
    fn gemini_root_strips_and_appends_fixed_pair() {
        let args = finalize_gemini_args(
            vec![
                "--approval-mode".into(),
                "default".into(),
                "--sandbox=true".into(),
                "--yolo".into(),
                "-y".into(),
                "-p".into(),
                "hi".into(),
            ],
            true,
        );
        assert_eq!(
            args,
            vec!["-p", "hi", GEMINI_APPROVAL_YOLO, GEMINI_SANDBOX_FALSE]
        );
    }

    #[test]
    fn gemini_non_root_leaves_args_alone() {
        let original = vec!["--yolo".to_string(), "-p".to_string(), "hi".to_string()];
        assert_eq!(finalize_gemini_args(original.clone(), false), original);
    }

    #[tokio::test]
    async fn echo_binary_streams_lines_and_clears_busy() {
        let dir = tempfile::tempdir().unwrap();
        let a = codex_agent(&dir, "session");
        let info = a.create_session("u1", "c1", None).await.unwrap();
        let mut stream = a
            .send_message(&info.session_id, "hello streaming", SendOptions::default())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        let all = chunks.join("");
        assert!(all.contains("hello streaming"));
        assert!(!a.get_session_info(&info.session_id).unwrap().is_busy);
    }

    #[tokio::test]
    async fn nonzero_exit_appends_exit_code_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let a = StreamingCliAgent::new(
            "codex",
            config(AgentKind::Codex, "/bin/sh", vec!["-c", "echo partial; exit 3"]),
            dir.path(),
            "session",
            "user-main",
            None,
            false,
        );
        let info = a.create_session("u1", "c1", None).await.unwrap();
        let mut stream = a
            .send_message(&info.session_id, "ignored", SendOptions::default())
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        let all = chunks.join("");
        assert!(all.contains("partial"));
        assert!(all.contains("❌ Exit code: 3"));
    }

    #[tokio::test]
    async fn require_bridge_without_client_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let a = StreamingCliAgent::new(
            "codex",
            config(AgentKind::Codex, "/bin/echo", vec!["{prompt}"]),
            dir.path(),
            "system",
            "ops-a",
            None,
            true,
        );
        let info = a.create_session("u1", "c1", None).await.unwrap();
        let mut stream = a
            .send_message(&info.session_id, "hi", SendOptions::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first, "❌ system_client_required");
    }
}
