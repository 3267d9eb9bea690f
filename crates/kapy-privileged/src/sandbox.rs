//! Bubblewrap sandbox wrappers for agent CLI subprocesses.
//!
//! Two shapes:
//! * **session wrap** — gateway-side local execution: read-only host
//!   binds, cron/spool masking, the session workspace bound writable.
//! * **fixed wrap** — daemon-side `agent_cli_exec`: the workspace and a
//!   per-instance home are mounted at fixed points (`/workspace`,
//!   `/sandbox-home`) with a tmpfs `/tmp`, so the agent sees the same
//!   filesystem shape regardless of host layout.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use kapy_core::config::BwrapConfig;
use tracing::warn;

const DEFAULT_RO_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/run", "/opt", "/data", "/var",
];

const DEFAULT_MASK_DIRS: &[&str] = &[
    "/root",
    "/home",
    "/etc/cron.d",
    "/etc/cron.daily",
    "/etc/cron.hourly",
    "/etc/cron.monthly",
    "/etc/cron.weekly",
    "/var/spool/cron",
    "/var/spool/cron/crontabs",
];

const DEFAULT_MASK_FILES: &[&str] = &["/etc/crontab"];

/// A fully materialized command line ready to spawn.
#[derive(Debug, Clone)]
pub struct WrappedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

pub struct BwrapSandbox {
    runtime_mode: String,
    config: BwrapConfig,
    probe_result: Mutex<Option<(bool, String)>>,
    warned_fallback: Mutex<bool>,
}

impl BwrapSandbox {
    pub fn new(runtime_mode: &str, config: BwrapConfig) -> Self {
        Self {
            runtime_mode: runtime_mode.trim().to_lowercase(),
            config,
            probe_result: Mutex::new(None),
            warned_fallback: Mutex::new(false),
        }
    }

    /// Minimal host probe to detect userns/AppArmor failures early.
    /// Runs once; the result is cached for the process lifetime.
    fn ensure_ready(&self) -> (bool, String) {
        let mut cached = self.probe_result.lock().unwrap();
        if let Some(result) = cached.as_ref() {
            return result.clone();
        }
        let result = self.probe_once();
        *cached = Some(result.clone());
        result
    }

    fn probe_once(&self) -> (bool, String) {
        if !self.config.enabled {
            return (true, "disabled".to_string());
        }
        if which::which(&self.config.command).is_err() {
            return (false, format!("{} not found in PATH", self.config.command));
        }
        match Command::new(&self.config.command)
            .args(["--ro-bind", "/", "/", "--", "/usr/bin/true"])
            .output()
        {
            Ok(out) if out.status.success() => (true, "ok".to_string()),
            Ok(out) => {
                let detail = String::from_utf8_lossy(&out.stderr).trim().to_string();
                if detail.is_empty() {
                    (false, format!("probe failed with {}", out.status))
                } else {
                    (false, detail)
                }
            }
            Err(e) => (false, format!("probe failed: {e}")),
        }
    }

    fn fallback(&self, command: &str, args: &[String], env: &HashMap<String, String>, reason: &str) -> Option<WrappedCommand> {
        if self.config.required {
            return None;
        }
        let mut warned = self.warned_fallback.lock().unwrap();
        if !*warned {
            warn!(reason, "bwrap sandbox unavailable, falling back to direct exec");
            *warned = true;
        }
        Some(WrappedCommand {
            command: command.to_string(),
            args: args.to_vec(),
            env: env.clone(),
        })
    }

    /// Wrap for session-mode local execution. Returns `None` only when the
    /// sandbox is required but unavailable.
    pub fn wrap_session(
        &self,
        command: &str,
        args: &[String],
        work_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Option<WrappedCommand> {
        if self.runtime_mode != "session" || !self.config.enabled {
            return Some(WrappedCommand {
                command: command.to_string(),
                args: args.to_vec(),
                env: env.clone(),
            });
        }
        let (ok, reason) = self.ensure_ready();
        if !ok {
            return self.fallback(command, args, env, &reason);
        }

        let work_dir = work_dir.to_string_lossy().into_owned();
        let mut env = env.clone();
        env.entry("TMPDIR".to_string())
            .or_insert_with(|| "/tmp".to_string());

        let mut wrapped: Vec<String> = vec!["--die-with-parent".into(), "--new-session".into(), "--unshare-all".into()];
        if self.config.share_network {
            wrapped.push("--share-net".into());
        }
        for path in DEFAULT_RO_PATHS
            .iter()
            .map(|s| s.to_string())
            .chain(self.config.readonly_paths.iter().cloned())
        {
            wrapped.extend(["--ro-bind-try".into(), path.clone(), path]);
        }
        wrapped.extend([
            "--proc".into(),
            "/proc".into(),
            "--dev".into(),
            "/dev".into(),
            "--tmpfs".into(),
            "/tmp".into(),
        ]);
        for path in std::iter::once(work_dir.clone())
            .chain(self.config.extra_writable_paths.iter().cloned())
        {
            wrapped.extend(["--bind".into(), path.clone(), path]);
        }
        for path in DEFAULT_MASK_DIRS {
            wrapped.extend(["--tmpfs".into(), path.to_string()]);
        }
        for path in DEFAULT_MASK_FILES {
            wrapped.extend(["--ro-bind-try".into(), "/dev/null".into(), path.to_string()]);
        }
        wrapped.extend(["--chdir".into(), work_dir, "--".into(), command.to_string()]);
        wrapped.extend(args.iter().cloned());

        Some(WrappedCommand {
            command: self.config.command.clone(),
            args: wrapped,
            env,
        })
    }

    /// Wrap for daemon-side execution with fixed mount points. The child
    /// always sees `/workspace` (cwd), `/sandbox-home`, and a fresh tmpfs
    /// `/tmp`; in session mode `/etc` is host-read-only, in system mode
    /// the caller already runs with root privileges so `/etc` stays bound.
    pub fn wrap_fixed(
        &self,
        command: &str,
        args: &[String],
        workspace: &Path,
        home: &Path,
        env: &HashMap<String, String>,
    ) -> Option<WrappedCommand> {
        if !self.config.enabled {
            return Some(WrappedCommand {
                command: command.to_string(),
                args: args.to_vec(),
                env: env.clone(),
            });
        }
        let (ok, reason) = self.ensure_ready();
        if !ok {
            return self.fallback(command, args, env, &reason);
        }

        let mut env = env.clone();
        env.insert("HOME".to_string(), "/sandbox-home".to_string());
        env.insert("TMPDIR".to_string(), "/tmp".to_string());

        let mut wrapped: Vec<String> = vec!["--die-with-parent".into(), "--new-session".into(), "--unshare-all".into()];
        if self.config.share_network {
            wrapped.push("--share-net".into());
        }
        for path in ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"] {
            wrapped.extend(["--ro-bind-try".into(), path.to_string(), path.to_string()]);
        }
        wrapped.extend([
            "--proc".into(),
            "/proc".into(),
            "--dev".into(),
            "/dev".into(),
            "--tmpfs".into(),
            "/tmp".into(),
            "--bind".into(),
            workspace.to_string_lossy().into_owned(),
            "/workspace".into(),
            "--bind".into(),
            home.to_string_lossy().into_owned(),
            "/sandbox-home".into(),
            "--chdir".into(),
            "/workspace".into(),
            "--".into(),
            command.to_string(),
        ]);
        wrapped.extend(args.iter().cloned());

        Some(WrappedCommand {
            command: self.config.command.clone(),
            args: wrapped,
            env,
        })
    }
}
