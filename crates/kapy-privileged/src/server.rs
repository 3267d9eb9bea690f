//! Privileged daemon: line-delimited JSON RPC over a Unix socket.
//!
//! Enforcement order per connection: peer-UID allowlist, peer-unit
//! allowlist, request decoding (size/shape), grant requirement, action
//! dispatch. One request, one response, then close.

use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kapy_core::config::DaemonConfig;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PrivilegedError, Result};
use crate::executor::SystemExecutor;
use crate::grant::SystemGrantManager;

/// Ops that always require a signed grant.
const GRANT_REQUIRED_OPS: &[&str] = &[
    "cron_upsert",
    "cron_delete",
    "docker_exec",
    "config_write",
    "config_append",
    "config_delete",
    "config_rollback",
];

#[derive(Debug, Clone, Default)]
struct PeerIdentity {
    uid: Option<u32>,
    units: HashSet<String>,
}

pub struct SystemServiceServer {
    socket_path: String,
    cfg: DaemonConfig,
    executor: Arc<SystemExecutor>,
    grants: Option<Arc<SystemGrantManager>>,
    shutdown: CancellationToken,
}

impl SystemServiceServer {
    pub fn new(
        socket_path: impl Into<String>,
        cfg: DaemonConfig,
        executor: Arc<SystemExecutor>,
        grants: Option<Arc<SystemGrantManager>>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            cfg,
            executor,
            grants,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token callers can use to stop the accept loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the socket and serve until the shutdown token fires.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let path = Path::new(&self.socket_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener =
            UnixListener::bind(path).map_err(|e| PrivilegedError::Bind(e.to_string()))?;
        self.apply_socket_permissions(path);
        info!(socket = %self.socket_path, "privileged daemon listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_conn(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        if Path::new(&self.socket_path).exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("privileged daemon stopped");
        Ok(())
    }

    fn apply_socket_permissions(&self, path: &Path) {
        if let Some(mode_str) = &self.cfg.socket_mode {
            let text = mode_str
                .trim()
                .trim_start_matches("0o")
                .trim_start_matches('0');
            if let Ok(mode) = u32::from_str_radix(if text.is_empty() { "0" } else { text }, 8) {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
            }
        }
        if self.cfg.socket_uid.is_some() || self.cfg.socket_gid.is_some() {
            let uid = self.cfg.socket_uid.map(|v| v as i64).unwrap_or(-1);
            let gid = self.cfg.socket_gid.map(|v| v as i64).unwrap_or(-1);
            let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes())
                .unwrap_or_default();
            // SAFETY: c_path is a valid NUL-terminated string; chown is
            // harmless on failure (we ignore the return code on purpose).
            unsafe {
                libc::chown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t);
            }
        }
    }

    async fn handle_conn(&self, stream: UnixStream) {
        let peer = extract_peer_identity(&stream);
        let (reader, mut writer) = stream.into_split();

        if !self.is_peer_uid_allowed(peer.uid) {
            let _ = reply(
                &mut writer,
                &json!({"ok": false, "reason": "peer_uid_not_allowed", "peer_uid": peer.uid}),
            )
            .await;
            return;
        }
        if !self.is_peer_unit_allowed(&peer.units) {
            let _ = reply(
                &mut writer,
                &json!({"ok": false, "reason": "peer_unit_not_allowed"}),
            )
            .await;
            return;
        }

        let timeout = Duration::from_secs_f64(self.cfg.request_timeout_seconds.max(0.1));
        let mut line = String::new();
        let mut reader = BufReader::new(reader).take(self.cfg.max_request_bytes as u64 + 1);
        let read = tokio::time::timeout(timeout, reader.read_line(&mut line)).await;

        let response = match read {
            Ok(Ok(0)) => json!({"ok": false, "reason": "empty_request"}),
            Ok(Ok(n)) if n > self.cfg.max_request_bytes => {
                json!({"ok": false, "reason": "request_too_large"})
            }
            Ok(Ok(_)) => match serde_json::from_str::<Value>(&line) {
                Ok(req) => self.process_request(&req, &peer).await,
                Err(e) => json!({"ok": false, "reason": format!("request_decode_failed:{e}")}),
            },
            Ok(Err(e)) => json!({"ok": false, "reason": format!("request_read_failed:{e}")}),
            Err(_) => json!({"ok": false, "reason": "request_timeout"}),
        };

        debug!(peer_uid = ?peer.uid, ok = response.get("ok").and_then(serde_json::Value::as_bool), "request handled");
        let _ = reply(&mut writer, &response).await;
    }

    fn is_peer_uid_allowed(&self, peer_uid: Option<u32>) -> bool {
        if self.cfg.allowed_peer_uids.is_empty() {
            return true;
        }
        match peer_uid {
            Some(uid) => self.cfg.allowed_peer_uids.contains(&uid),
            None => false,
        }
    }

    fn is_peer_unit_allowed(&self, units: &HashSet<String>) -> bool {
        if self.cfg.allowed_peer_units.is_empty() {
            return true;
        }
        self.cfg
            .allowed_peer_units
            .iter()
            .any(|allowed| units.contains(allowed))
    }

    fn requires_grant(&self, action: &Value) -> bool {
        if self.cfg.require_grant_for_all_ops {
            return true;
        }
        let op = action
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        if GRANT_REQUIRED_OPS.contains(&op.as_str()) {
            return true;
        }
        if op == "read_file" {
            let path = action.get("path").and_then(Value::as_str).unwrap_or("");
            return self.executor.is_sensitive_path(path);
        }
        false
    }

    async fn process_request(&self, req: &Value, peer: &PeerIdentity) -> Value {
        let obj = match req.as_object() {
            Some(obj) => obj,
            None => return json!({"ok": false, "reason": "request_not_object"}),
        };
        let action = match obj.get("action").filter(|a| a.is_object()) {
            Some(action) => action.clone(),
            None => return json!({"ok": false, "reason": "action_not_object"}),
        };
        let user_id = obj
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if user_id.is_empty() {
            return json!({"ok": false, "reason": "user_id_required"});
        }

        if self.requires_grant(&action) {
            let grants = match &self.grants {
                Some(g) => Arc::clone(g),
                None => return json!({"ok": false, "reason": "grant_required_but_unavailable"}),
            };
            let token = match obj.get("grant").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => token.to_string(),
                _ => return json!({"ok": false, "reason": "grant_required"}),
            };
            let (ok, reason, _) = grants.verify(&token, &user_id, &action, true);
            if !ok {
                warn!(user_id, reason, "grant verification failed");
                return json!({"ok": false, "reason": format!("grant_invalid:{reason}")});
            }
        }

        // Executors block on subprocesses and file I/O; keep the accept
        // loop responsive by moving them off the async threads.
        let executor = Arc::clone(&self.executor);
        let peer_uid = peer.uid;
        let peer_units = peer.units.clone();
        let dispatched = action.clone();
        let result = tokio::task::spawn_blocking(move || {
            execute_action(&executor, &dispatched, peer_uid, &peer_units)
        })
        .await;
        let response = match result {
            Ok(value) => value,
            Err(e) => json!({"ok": false, "reason": format!("handler_error:{e}")}),
        };

        let op = action.get("op").and_then(Value::as_str).unwrap_or("unknown");
        crate::audit::audit_event("sysd", "-", &user_id, op, &action, &response);
        response
    }
}

fn execute_action(
    executor: &SystemExecutor,
    action: &Value,
    peer_uid: Option<u32>,
    peer_units: &HashSet<String>,
) -> Value {
    let op = action
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    match op.as_str() {
        "journal" => executor.read_journal(
            action.get("unit").and_then(Value::as_str),
            action.get("lines").and_then(Value::as_u64).unwrap_or(100) as usize,
            action.get("since").and_then(Value::as_str),
        ),
        "read_file" => executor.read_file(
            action.get("path").and_then(Value::as_str).unwrap_or(""),
            action
                .get("max_bytes")
                .and_then(Value::as_u64)
                .map(|v| v as usize),
        ),
        "cron_list" => executor.cron_list(),
        "cron_upsert" => executor.cron_upsert(
            action.get("name").and_then(Value::as_str).unwrap_or(""),
            action.get("schedule").and_then(Value::as_str).unwrap_or(""),
            action.get("command").and_then(Value::as_str).unwrap_or(""),
            action.get("user").and_then(Value::as_str).unwrap_or("root"),
        ),
        "cron_delete" => {
            executor.cron_delete(action.get("name").and_then(Value::as_str).unwrap_or(""))
        }
        "docker_exec" => match action.get("args").and_then(Value::as_array) {
            Some(args) => {
                let args: Vec<String> = args
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                executor.docker_exec(&args)
            }
            None => json!({"ok": false, "reason": "docker_args_not_list"}),
        },
        "config_write" => executor.write_file(
            action.get("path").and_then(Value::as_str).unwrap_or(""),
            action.get("content").and_then(Value::as_str).unwrap_or(""),
            false,
            true,
        ),
        "config_append" => executor.write_file(
            action.get("path").and_then(Value::as_str).unwrap_or(""),
            action.get("content").and_then(Value::as_str).unwrap_or(""),
            true,
            true,
        ),
        "config_delete" => {
            executor.delete_file(action.get("path").and_then(Value::as_str).unwrap_or(""))
        }
        "config_rollback" => executor.restore_file(
            action.get("path").and_then(Value::as_str).unwrap_or(""),
            action
                .get("backup_path")
                .and_then(Value::as_str)
                .unwrap_or(""),
        ),
        "agent_cli_exec" => executor.agent_cli_exec(action, peer_uid, peer_units),
        _ => json!({"ok": false, "reason": "op_not_supported"}),
    }
}

async fn reply(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    payload: &Value,
) -> std::io::Result<()> {
    let wire = format!("{payload}\n");
    writer.write_all(wire.as_bytes()).await?;
    writer.flush().await
}

/// Peer credentials via SO_PEERCRED, plus best-effort systemd unit names
/// from the peer's cgroup.
fn extract_peer_identity(stream: &UnixStream) -> PeerIdentity {
    let fd = stream.as_raw_fd();
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: cred is a properly sized out-buffer for SO_PEERCRED.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return PeerIdentity::default();
    }
    PeerIdentity {
        uid: Some(cred.uid),
        units: peer_units_from_cgroup(cred.pid),
    }
}

/// Parse `/proc/<pid>/cgroup` for `*.service` unit names.
fn peer_units_from_cgroup(pid: i32) -> HashSet<String> {
    let mut units = HashSet::new();
    if pid <= 0 {
        return units;
    }
    let raw = match std::fs::read_to_string(format!("/proc/{pid}/cgroup")) {
        Ok(raw) => raw,
        Err(_) => return units,
    };
    for line in raw.lines() {
        for segment in line.split('/') {
            if segment.ends_with(".service") {
                units.insert(segment.to_string());
            }
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapy_core::config::{DaemonConfig, ExecutorConfig};

    fn server(dir: &tempfile::TempDir, cfg: DaemonConfig) -> Arc<SystemServiceServer> {
        let exec_cfg = ExecutorConfig {
            enabled: true,
            write_allowed_paths: vec![dir.path().to_string_lossy().into_owned()],
            cron_dir: dir.path().join("cron.d").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let executor = Arc::new(SystemExecutor::new(exec_cfg, "system"));
        let grants = Arc::new(SystemGrantManager::new("test-secret", 60).unwrap());
        Arc::new(SystemServiceServer::new(
            dir.path().join("sysd.sock").to_string_lossy().into_owned(),
            cfg,
            executor,
            Some(grants),
        ))
    }

    #[tokio::test]
    async fn grant_required_op_without_grant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(&dir, DaemonConfig::default());
        let req = json!({
            "user_id": "u1",
            "action": {"op": "docker_exec", "args": ["ps"]},
        });
        let out = s.process_request(&req, &PeerIdentity::default()).await;
        assert_eq!(out["reason"], "grant_required");
    }

    #[tokio::test]
    async fn cron_list_needs_no_grant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cron.d")).unwrap();
        let s = server(&dir, DaemonConfig::default());
        let req = json!({
            "user_id": "u1",
            "action": {"op": "cron_list"},
        });
        let out = s.process_request(&req, &PeerIdentity::default()).await;
        assert_eq!(out["ok"], true);
    }

    #[tokio::test]
    async fn hardened_mode_requires_grant_for_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cron.d")).unwrap();
        let s = server(
            &dir,
            DaemonConfig {
                require_grant_for_all_ops: true,
                ..Default::default()
            },
        );
        let req = json!({
            "user_id": "u1",
            "action": {"op": "cron_list"},
        });
        let out = s.process_request(&req, &PeerIdentity::default()).await;
        assert_eq!(out["reason"], "grant_required");
    }

    #[tokio::test]
    async fn malformed_requests_get_stable_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(&dir, DaemonConfig::default());
        let out = s
            .process_request(&json!([1, 2, 3]), &PeerIdentity::default())
            .await;
        assert_eq!(out["reason"], "request_not_object");
        let out = s
            .process_request(&json!({"user_id": "u1"}), &PeerIdentity::default())
            .await;
        assert_eq!(out["reason"], "action_not_object");
        let out = s
            .process_request(
                &json!({"action": {"op": "cron_list"}}),
                &PeerIdentity::default(),
            )
            .await;
        assert_eq!(out["reason"], "user_id_required");
    }

    #[tokio::test]
    async fn unknown_op_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(&dir, DaemonConfig::default());
        let req = json!({"user_id": "u1", "action": {"op": "format_disk"}});
        let out = s.process_request(&req, &PeerIdentity::default()).await;
        assert_eq!(out["reason"], "op_not_supported");
    }

    #[tokio::test]
    async fn end_to_end_over_unix_socket_with_grant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cron.d")).unwrap();
        let grants = Arc::new(SystemGrantManager::new("e2e-secret", 60).unwrap());
        let exec_cfg = ExecutorConfig {
            enabled: true,
            write_allowed_paths: vec![dir.path().to_string_lossy().into_owned()],
            cron_dir: dir.path().join("cron.d").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let socket_path = dir.path().join("sysd.sock").to_string_lossy().into_owned();
        let server = Arc::new(SystemServiceServer::new(
            socket_path.clone(),
            DaemonConfig::default(),
            Arc::new(SystemExecutor::new(exec_cfg, "system")),
            Some(Arc::clone(&grants)),
        ));
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(Arc::clone(&server).run());

        // Wait for the socket to appear.
        for _ in 0..50 {
            if Path::new(&socket_path).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let action = json!({"op": "cron_upsert", "name": "job", "schedule": "0 1 * * *", "command": "true", "user": "root"});
        let token = grants.issue("u1", &action);
        let client = crate::client::SystemServiceClient::new(&socket_path, 5.0);
        let out = client.execute("u1", &action, Some(&token)).await;
        assert_eq!(out["ok"], true, "daemon rejected: {out}");

        // Replaying the same grant must fail.
        let out = client.execute("u1", &action, Some(&token)).await;
        assert_eq!(out["reason"], "grant_invalid:token_replayed");

        shutdown.cancel();
        let _ = handle.await;
    }
}
