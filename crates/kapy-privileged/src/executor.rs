//! Local executor for privileged system actions.
//!
//! All results are plain JSON objects with an `ok` flag and a stable
//! `reason` code on failure; the daemon ships them back verbatim and the
//! audit layer redacts content fields before logging.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use kapy_core::config::ExecutorConfig;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::sandbox::BwrapSandbox;

pub struct SystemExecutor {
    cfg: ExecutorConfig,
    sandbox: BwrapSandbox,
}

impl SystemExecutor {
    pub fn new(cfg: ExecutorConfig, runtime_mode: &str) -> Self {
        let sandbox = BwrapSandbox::new(runtime_mode, cfg.agent_cli.bwrap.clone());
        Self { cfg, sandbox }
    }

    // ── path safety ───────────────────────────────────────────

    /// Resolve to an absolute, symlink-followed path. Non-existent paths
    /// are normalized lexically (`.`/`..` components collapsed) after
    /// resolving the deepest existing ancestor, so a symlinked parent
    /// cannot smuggle a write outside the allowlist.
    fn normalize_path(path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        let abs = if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        };
        if let Ok(resolved) = abs.canonicalize() {
            return resolved;
        }
        // Resolve the deepest existing ancestor, then re-attach the rest.
        let mut existing = abs.clone();
        let mut tail: Vec<std::ffi::OsString> = Vec::new();
        while !existing.exists() {
            match existing.file_name() {
                Some(name) => {
                    tail.push(name.to_os_string());
                    existing.pop();
                }
                None => break,
            }
        }
        let mut base = existing.canonicalize().unwrap_or(existing);
        for part in tail.iter().rev() {
            base.push(part);
        }
        lexical_normalize(&base)
    }

    fn path_matches_prefixes(path: &str, prefixes: &[String]) -> bool {
        let normalized = Self::normalize_path(path);
        for prefix in prefixes {
            let p = Self::normalize_path(prefix);
            if p == Path::new("/") {
                return true;
            }
            if normalized == p || normalized.starts_with(&p) {
                return true;
            }
        }
        false
    }

    pub fn is_sensitive_path(&self, path: &str) -> bool {
        Self::path_matches_prefixes(path, &self.cfg.sensitive_read_paths)
    }

    pub fn is_write_allowed(&self, path: &str) -> bool {
        Self::path_matches_prefixes(path, &self.cfg.write_allowed_paths)
    }

    // ── read ops ──────────────────────────────────────────────

    pub fn read_file(&self, path: &str, max_bytes: Option<usize>) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        if !Path::new(path).is_absolute() {
            return json!({"ok": false, "reason": "path_not_absolute"});
        }
        let limit = match max_bytes {
            Some(n) if n > 0 => n.min(self.cfg.max_read_bytes),
            _ => self.cfg.max_read_bytes,
        };
        let p = Self::normalize_path(path);
        if !p.exists() {
            return json!({"ok": false, "reason": "file_not_found"});
        }
        if !p.is_file() {
            return json!({"ok": false, "reason": "not_a_file"});
        }
        let size_bytes = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
        let data = match std::fs::read(&p) {
            Ok(data) => data,
            Err(e) => return json!({"ok": false, "reason": format!("file_read_error:{e}")}),
        };
        let truncated = data.len() > limit;
        let payload = &data[..data.len().min(limit)];
        let text = String::from_utf8_lossy(payload).into_owned();

        json!({
            "ok": true,
            "path": p.to_string_lossy(),
            "size_bytes": size_bytes,
            "returned_bytes": payload.len(),
            "truncated": truncated,
            "text": text,
            "sensitive": self.is_sensitive_path(&p.to_string_lossy()),
        })
    }

    pub fn read_journal(&self, unit: Option<&str>, lines: usize, since: Option<&str>) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        let line_count = lines.clamp(1, self.cfg.max_journal_lines);
        let mut cmd = Command::new("journalctl");
        cmd.args(["--no-pager", "-n", &line_count.to_string()]);
        if let Some(unit) = unit {
            cmd.args(["-u", unit]);
        }
        if let Some(since) = since {
            cmd.args(["--since", since]);
        }
        let completed = match run_with_timeout(cmd, Duration::from_secs(20)) {
            Ok(out) => out,
            Err(e) => return json!({"ok": false, "reason": format!("journal_exec_error:{e}")}),
        };
        let stdout = String::from_utf8_lossy(&completed.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&completed.stderr).trim().to_string();
        if !completed.status.success() {
            return json!({
                "ok": false,
                "reason": "journalctl_failed",
                "returncode": completed.status.code().unwrap_or(-1),
                "stderr": truncate_chars(&stderr, 2000),
            });
        }
        json!({
            "ok": true,
            "unit": unit,
            "lines": line_count,
            "output": stdout,
        })
    }

    // ── write ops ─────────────────────────────────────────────

    pub fn write_file(&self, path: &str, content: &str, append: bool, create_backup: bool) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        let normalized = Self::normalize_path(path);
        let normalized_str = normalized.to_string_lossy().into_owned();
        if !self.is_write_allowed(&normalized_str) {
            return json!({"ok": false, "reason": "write_path_not_allowed"});
        }

        let mut backup_path: Option<String> = None;
        if let Some(parent) = normalized.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return json!({"ok": false, "reason": format!("write_file_error:{e}")});
            }
        }
        if create_backup && normalized.is_file() {
            let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let name = normalized
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let backup = normalized.with_file_name(format!("{name}.bak.{ts}"));
            match std::fs::copy(&normalized, &backup) {
                Ok(_) => backup_path = Some(backup.to_string_lossy().into_owned()),
                Err(e) => return json!({"ok": false, "reason": format!("write_file_error:{e}")}),
            }
        }

        let result = if append {
            use std::io::Write;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&normalized)
                .and_then(|mut f| f.write_all(content.as_bytes()))
        } else {
            // Full write goes to a temp sibling first so a failed write
            // never leaves a partial target file.
            let tmp = normalized.with_extension("kapy.tmp");
            std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, &normalized))
        };
        if let Err(e) = result {
            return json!({"ok": false, "reason": format!("write_file_error:{e}")});
        }
        info!(path = %normalized_str, append, "config file written");
        json!({"ok": true, "path": normalized_str, "backup_path": backup_path, "append": append})
    }

    pub fn delete_file(&self, path: &str) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        let normalized = Self::normalize_path(path);
        let normalized_str = normalized.to_string_lossy().into_owned();
        if !self.is_write_allowed(&normalized_str) {
            return json!({"ok": false, "reason": "write_path_not_allowed"});
        }
        if !normalized.exists() {
            return json!({"ok": false, "reason": "file_not_found"});
        }
        if let Err(e) = std::fs::remove_file(&normalized) {
            return json!({"ok": false, "reason": format!("delete_file_error:{e}")});
        }
        json!({"ok": true, "path": normalized_str})
    }

    pub fn restore_file(&self, path: &str, backup_path: &str) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        let target = Self::normalize_path(path);
        let target_str = target.to_string_lossy().into_owned();
        if !self.is_write_allowed(&target_str) {
            return json!({"ok": false, "reason": "write_path_not_allowed"});
        }
        let backup = Self::normalize_path(backup_path);
        let backup_str = backup.to_string_lossy().into_owned();
        if !self.is_write_allowed(&backup_str) {
            return json!({"ok": false, "reason": "write_path_not_allowed"});
        }
        if !backup.exists() {
            return json!({"ok": false, "reason": "backup_not_found"});
        }
        if !backup.is_file() {
            return json!({"ok": false, "reason": "backup_not_file"});
        }
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::copy(&backup, &target) {
            return json!({"ok": false, "reason": format!("restore_file_error:{e}")});
        }
        json!({"ok": true, "path": target_str, "backup_path": backup_str})
    }

    // ── cron ops ──────────────────────────────────────────────

    fn validate_cron_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    fn cron_file_path(&self, name: &str) -> Option<PathBuf> {
        if !Self::validate_cron_name(name) {
            return None;
        }
        Some(Path::new(&self.cfg.cron_dir).join(name))
    }

    pub fn cron_list(&self) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        let dir = Path::new(&self.cfg.cron_dir);
        if !dir.exists() {
            return json!({"ok": false, "reason": "cron_dir_not_found"});
        }
        if !dir.is_dir() {
            return json!({"ok": false, "reason": "cron_dir_not_directory"});
        }
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut items: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                items.sort();
                json!({"ok": true, "items": items})
            }
            Err(e) => json!({"ok": false, "reason": format!("cron_list_error:{e}")}),
        }
    }

    pub fn cron_upsert(&self, name: &str, schedule: &str, command: &str, user: &str) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        // Newlines in schedule or command would let a single entry smuggle
        // additional cron lines.
        if schedule.contains('\n') || schedule.contains('\r') || command.contains('\n') || command.contains('\r') {
            return json!({"ok": false, "reason": "cron_line_contains_newline"});
        }
        let cron_path = match self.cron_file_path(name) {
            Some(p) => p,
            None => return json!({"ok": false, "reason": "invalid_cron_name"}),
        };
        let path_str = cron_path.to_string_lossy().into_owned();
        if !self.is_write_allowed(&path_str) {
            return json!({"ok": false, "reason": "write_path_not_allowed"});
        }
        let content = format!(
            "SHELL=/bin/bash\nPATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n{schedule} {user} {command}\n"
        );
        self.write_file(&path_str, &content, false, true)
    }

    pub fn cron_delete(&self, name: &str) -> Value {
        let cron_path = match self.cron_file_path(name) {
            Some(p) => p,
            None => return json!({"ok": false, "reason": "invalid_cron_name"}),
        };
        self.delete_file(&cron_path.to_string_lossy())
    }

    // ── docker ────────────────────────────────────────────────

    pub fn docker_exec(&self, args: &[String]) -> Value {
        if !self.cfg.enabled {
            return json!({"ok": false, "reason": "system_executor_disabled"});
        }
        if args.is_empty() {
            return json!({"ok": false, "reason": "docker_args_required"});
        }
        let subcommand = args[0].to_lowercase();
        if !self
            .cfg
            .docker_allowed_subcommands
            .iter()
            .any(|s| s == &subcommand)
        {
            return json!({"ok": false, "reason": "docker_subcommand_not_allowed"});
        }

        let mut cmd = Command::new(&self.cfg.docker_bin);
        cmd.args(args);
        let completed = match run_with_timeout(cmd, Duration::from_secs(120)) {
            Ok(out) => out,
            Err(e) => return json!({"ok": false, "reason": format!("docker_exec_error:{e}")}),
        };
        let stdout = String::from_utf8_lossy(&completed.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&completed.stderr).into_owned();
        let mut all_out = stdout;
        if !stderr.is_empty() {
            all_out.push('\n');
            all_out.push_str(&stderr);
        }
        let all_out = all_out.trim().to_string();
        let truncated = all_out.len() > self.cfg.max_docker_output_bytes;
        let output = truncate_chars(&all_out, self.cfg.max_docker_output_bytes);

        json!({
            "ok": completed.status.success(),
            "returncode": completed.status.code().unwrap_or(-1),
            "output": output,
            "truncated": truncated,
        })
    }

    // ── agent CLI execution ───────────────────────────────────

    /// Execute an agent CLI on behalf of a gateway instance.
    ///
    /// `peer_units` carries the systemd unit names of the calling peer,
    /// used to pin the requested mode/instance to the connection.
    pub fn agent_cli_exec(&self, action: &Value, peer_uid: Option<u32>, peer_units: &HashSet<String>) -> Value {
        let cli = &self.cfg.agent_cli;
        if !self.cfg.enabled || !cli.enabled {
            return json!({"ok": false, "reason": "agent_cli_disabled"});
        }

        let agent = action.get("agent").and_then(Value::as_str).unwrap_or("");
        let mode = action.get("mode").and_then(Value::as_str).unwrap_or("");
        let instance_id = action
            .get("instance_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        let command = action.get("command").and_then(Value::as_str).unwrap_or("");
        let cwd = action.get("cwd").and_then(Value::as_str).unwrap_or("");
        let args: Vec<String> = action
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        let env: HashMap<String, String> = action
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let timeout_seconds = action
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(300);

        if agent.is_empty() || command.is_empty() || instance_id.is_empty() {
            return json!({"ok": false, "reason": "agent_cli_action_incomplete"});
        }
        if !cli.allowed_agents.iter().any(|a| a == agent) {
            return json!({"ok": false, "reason": "agent_not_allowed"});
        }
        if !cli.allowed_commands.iter().any(|c| c == command) {
            return json!({"ok": false, "reason": "command_not_allowed"});
        }

        // Pin the requested mode/instance to the caller's systemd unit.
        if !peer_units.is_empty() {
            let expected = format!("cli-gateway-{mode}@{instance_id}.service");
            if !peer_units.contains(&expected) {
                let same_instance = peer_units
                    .iter()
                    .any(|u| u.ends_with(&format!("@{instance_id}.service")));
                let reason = if same_instance {
                    "mode_mismatch"
                } else {
                    "peer_unit_not_allowed"
                };
                warn!(agent, mode, instance_id, ?peer_uid, reason, "agent_cli_exec rejected");
                return json!({"ok": false, "reason": reason});
            }
        }

        // cwd must live inside {workspace_parent}/{instance_id}/{agent}.
        let workspace_root =
            Self::normalize_path(&format!("{}/{}/{}", cli.workspace_parent, instance_id, agent));
        let cwd_path = Self::normalize_path(cwd);
        if !cwd_path.starts_with(&workspace_root) {
            return json!({"ok": false, "reason": "cwd_not_in_workspace"});
        }
        if !cwd_path.is_dir() {
            return json!({"ok": false, "reason": "cwd_not_found"});
        }

        let resolved = match which::which(command) {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => return json!({"ok": false, "reason": "command_not_found"}),
        };

        let home = Self::normalize_path(&format!("{}/{}", cli.home_parent, instance_id));
        let _ = std::fs::create_dir_all(&home);

        let wrapped = match self.sandbox.wrap_fixed(&resolved, &args, &cwd_path, &home, &env) {
            Some(w) => w,
            None => return json!({"ok": false, "reason": "bwrap_required_but_unavailable"}),
        };

        // A root daemon drops to the configured UID before exec'ing the
        // agent binary; setpriv keeps the drop outside our own code path.
        let (final_cmd, final_args) = if is_root() && cli.run_as_uid.is_some() {
            let uid = cli.run_as_uid.unwrap_or(0);
            let gid = cli.run_as_gid.unwrap_or(uid);
            let mut argv = vec![
                "--reuid".to_string(),
                uid.to_string(),
                "--regid".to_string(),
                gid.to_string(),
                "--clear-groups".to_string(),
                "--".to_string(),
                wrapped.command.clone(),
            ];
            argv.extend(wrapped.args.clone());
            ("setpriv".to_string(), argv)
        } else {
            (wrapped.command.clone(), wrapped.args.clone())
        };

        let mut cmd = Command::new(&final_cmd);
        cmd.args(&final_args)
            .current_dir(&cwd_path)
            .envs(&wrapped.env);
        info!(agent, instance_id, command = %final_cmd, "executing agent CLI");
        let completed = match run_with_timeout(cmd, Duration::from_secs(timeout_seconds)) {
            Ok(out) => out,
            Err(e) => return json!({"ok": false, "reason": format!("agent_cli_exec_error:{e}")}),
        };

        json!({
            "ok": completed.status.success(),
            "returncode": completed.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&completed.stdout),
            "stderr": String::from_utf8_lossy(&completed.stderr),
        })
    }
}

fn is_root() -> bool {
    // SAFETY: getuid has no failure modes.
    unsafe { libc::getuid() == 0 }
}

/// Run a command with a wall-clock timeout, killing the child on expiry.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<std::process::Output> {
    use std::io::Read;
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null());
    let mut child = cmd.spawn()?;
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_status) => break,
            None => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("timed out after {}s", timeout.as_secs()),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr);
    }
    let status = child.wait()?;
    Ok(std::process::Output {
        status,
        stdout,
        stderr,
    })
}

fn truncate_chars(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
