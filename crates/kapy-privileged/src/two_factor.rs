//! Two-factor approval manager for system-level actions.
//!
//! Holds per-user TOTP secrets, short-lived action challenges, interactive
//! enrollment sessions, the "next message must be a 6-digit code" pending
//! state, and chat-scoped approval grace windows. Secrets, enrollments,
//! and pending-input state persist to a JSON file with atomic writes;
//! challenges and approval windows are in-memory only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::grant::action_hash;
use crate::totp;

#[derive(Debug, Clone)]
pub struct TwoFactorChallenge {
    pub challenge_id: String,
    pub user_id: String,
    /// Canonicalized action payload.
    pub action: serde_json::Value,
    pub action_hash: String,
    pub created_at: f64,
    pub expires_at: f64,
    pub approved: bool,
    pub approved_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub secret: String,
    pub account_name: String,
    pub issuer: String,
    pub otpauth_uri: String,
    pub created_at: f64,
    pub expires_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInput {
    pub challenge_id: String,
    pub retry_cmd: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct ApprovalWindow {
    pub created_at: f64,
    pub expires_at: f64,
    pub ttl_seconds: u64,
}

/// Result of starting an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentTicket {
    pub secret: String,
    pub account_name: String,
    pub issuer: String,
    pub otpauth_uri: String,
    pub expires_at: f64,
    pub reused: bool,
    pub already_configured: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentStatus {
    pub configured: bool,
    pub pending: bool,
    pub pending_expires_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeStatus {
    pub exists: bool,
    pub challenge_id: Option<String>,
    pub approved: bool,
    pub created_at: Option<f64>,
    pub expires_at: Option<f64>,
    pub approved_at: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    secrets: HashMap<String, String>,
    #[serde(default)]
    enrollments: HashMap<String, Enrollment>,
    #[serde(default)]
    pending_input: HashMap<String, PendingInput>,
}

struct Inner {
    persisted: PersistedState,
    challenges: HashMap<String, TwoFactorChallenge>,
    approval_windows: HashMap<String, ApprovalWindow>,
}

pub struct TwoFactorManager {
    pub enabled: bool,
    ttl_seconds: u64,
    valid_window: i64,
    period_seconds: u64,
    digits: u32,
    pub issuer: String,
    pub approval_grace_seconds: u64,
    enrollment_ttl_seconds: u64,
    state_file: PathBuf,
    inner: Mutex<Inner>,
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

impl TwoFactorManager {
    pub fn new(cfg: &kapy_core::config::TwoFactorConfig) -> Self {
        let state_file = PathBuf::from(&cfg.state_file);
        let persisted = Self::load(&state_file);
        info!(
            enabled = cfg.enabled,
            users = persisted.secrets.len(),
            "two-factor manager initialized"
        );
        Self {
            enabled: cfg.enabled,
            ttl_seconds: cfg.ttl_seconds,
            valid_window: cfg.valid_window,
            period_seconds: cfg.period_seconds,
            digits: cfg.digits,
            issuer: cfg.issuer.clone(),
            approval_grace_seconds: cfg.approval_grace_seconds,
            enrollment_ttl_seconds: cfg.enrollment_ttl_seconds,
            state_file,
            inner: Mutex::new(Inner {
                persisted,
                challenges: HashMap::new(),
                approval_windows: HashMap::new(),
            }),
        }
    }

    fn load(path: &PathBuf) -> PersistedState {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "failed to parse two-factor state, starting empty");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        }
    }

    /// Atomic write: serialize to a sibling temp file, then rename.
    fn save(&self, state: &PersistedState) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.state_file.with_extension("json.tmp");
        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize two-factor state");
                return;
            }
        };
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &self.state_file)) {
            error!(error = %e, path = %self.state_file.display(), "failed to persist two-factor state");
        }
    }

    fn reap(inner: &mut Inner, now: f64) {
        inner.challenges.retain(|_, ch| ch.expires_at > now);
        inner.approval_windows.retain(|_, w| w.expires_at > now);
    }

    // ── challenges ─────────────────────────────────────────────

    pub fn create_challenge(
        &self,
        user_id: &str,
        action: &serde_json::Value,
    ) -> TwoFactorChallenge {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);
        let challenge = TwoFactorChallenge {
            challenge_id: random_hex(8),
            user_id: user_id.to_string(),
            action: action.clone(),
            action_hash: action_hash(action),
            created_at: now,
            expires_at: now + self.ttl_seconds as f64,
            approved: false,
            approved_at: None,
        };
        inner
            .challenges
            .insert(challenge.challenge_id.clone(), challenge.clone());
        challenge
    }

    /// Validate ownership, expiry, action hash, and the TOTP code, then
    /// mark the challenge approved.
    pub fn approve_challenge(
        &self,
        challenge_id: &str,
        user_id: &str,
        code: &str,
        action: Option<&serde_json::Value>,
    ) -> (bool, &'static str) {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);

        let secret = inner.persisted.secrets.get(user_id).cloned();
        let ch = match inner.challenges.get_mut(challenge_id) {
            Some(ch) => ch,
            None => return (false, "challenge_not_found"),
        };
        if ch.user_id != user_id {
            return (false, "challenge_owner_mismatch");
        }
        if ch.approved {
            return (false, "challenge_already_approved");
        }
        if ch.expires_at <= now {
            return (false, "challenge_expired");
        }
        let payload_hash = match action {
            Some(payload) => action_hash(payload),
            None => ch.action_hash.clone(),
        };
        if ch.action_hash != payload_hash {
            return (false, "action_hash_mismatch");
        }
        if !self.enabled {
            return (false, "two_factor_disabled");
        }
        let secret = match secret {
            Some(s) if !s.is_empty() => s,
            _ => return (false, "totp_secret_not_configured"),
        };
        if !totp::verify_totp(
            &secret,
            code,
            now as u64,
            self.period_seconds,
            self.digits,
            self.valid_window,
        ) {
            return (false, "totp_code_invalid");
        }

        ch.approved = true;
        ch.approved_at = Some(now);
        (true, "approved")
    }

    /// Single-shot consumption of an approved challenge.
    pub fn consume_approval(
        &self,
        challenge_id: &str,
        user_id: &str,
        action: Option<&serde_json::Value>,
    ) -> (bool, &'static str) {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);

        let ch = match inner.challenges.get(challenge_id) {
            Some(ch) => ch.clone(),
            None => return (false, "challenge_not_found"),
        };
        if ch.user_id != user_id {
            return (false, "challenge_owner_mismatch");
        }
        if ch.expires_at <= now {
            inner.challenges.remove(challenge_id);
            return (false, "challenge_expired");
        }
        if !ch.approved {
            return (false, "challenge_not_approved");
        }
        let payload_hash = match action {
            Some(payload) => action_hash(payload),
            None => ch.action_hash.clone(),
        };
        if ch.action_hash != payload_hash {
            return (false, "action_hash_mismatch");
        }
        inner.challenges.remove(challenge_id);
        (true, "approved")
    }

    pub fn status(&self, challenge_id: &str, user_id: &str) -> ChallengeStatus {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);
        match inner.challenges.get(challenge_id) {
            Some(ch) if ch.user_id == user_id => ChallengeStatus {
                exists: true,
                challenge_id: Some(ch.challenge_id.clone()),
                approved: ch.approved,
                created_at: Some(ch.created_at),
                expires_at: Some(ch.expires_at),
                approved_at: ch.approved_at,
            },
            _ => ChallengeStatus {
                exists: false,
                challenge_id: None,
                approved: false,
                created_at: None,
                expires_at: None,
                approved_at: None,
            },
        }
    }

    /// Revoke a challenge outright (pending-input failure path).
    pub fn revoke_challenge(&self, challenge_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.challenges.remove(challenge_id);
    }

    // ── enrollment ─────────────────────────────────────────────

    pub fn begin_enrollment(
        &self,
        user_id: &str,
        account_name: &str,
        issuer: &str,
    ) -> EnrollmentTicket {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        let already_configured = inner.persisted.secrets.contains_key(user_id);

        // Reuse a still-valid pending enrollment so a double "setup start"
        // does not invalidate a QR code the user already scanned.
        if let Some(existing) = inner.persisted.enrollments.get(user_id) {
            if existing.expires_at > now {
                return EnrollmentTicket {
                    secret: existing.secret.clone(),
                    account_name: existing.account_name.clone(),
                    issuer: existing.issuer.clone(),
                    otpauth_uri: existing.otpauth_uri.clone(),
                    expires_at: existing.expires_at,
                    reused: true,
                    already_configured,
                };
            }
        }

        let secret = totp::generate_secret();
        let otpauth_uri = totp::otpauth_uri(
            &secret,
            issuer,
            account_name,
            self.period_seconds,
            self.digits,
        );
        let enrollment = Enrollment {
            secret: secret.clone(),
            account_name: account_name.to_string(),
            issuer: issuer.to_string(),
            otpauth_uri: otpauth_uri.clone(),
            created_at: now,
            expires_at: now + self.enrollment_ttl_seconds as f64,
        };
        inner
            .persisted
            .enrollments
            .insert(user_id.to_string(), enrollment.clone());
        self.save(&inner.persisted);

        EnrollmentTicket {
            secret,
            account_name: account_name.to_string(),
            issuer: issuer.to_string(),
            otpauth_uri,
            expires_at: enrollment.expires_at,
            reused: false,
            already_configured,
        }
    }

    /// Verify the code against the pending secret and persist it as the
    /// user's active secret (overwriting any previous binding).
    pub fn verify_enrollment(&self, user_id: &str, code: &str) -> (bool, &'static str) {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        let enrollment = match inner.persisted.enrollments.get(user_id) {
            Some(e) => e.clone(),
            None => return (false, "enrollment_not_found"),
        };
        if enrollment.expires_at <= now {
            inner.persisted.enrollments.remove(user_id);
            self.save(&inner.persisted);
            return (false, "enrollment_expired");
        }
        if !totp::verify_totp(
            &enrollment.secret,
            code,
            now as u64,
            self.period_seconds,
            self.digits,
            self.valid_window,
        ) {
            return (false, "totp_code_invalid");
        }
        inner
            .persisted
            .secrets
            .insert(user_id.to_string(), enrollment.secret.clone());
        inner.persisted.enrollments.remove(user_id);
        self.save(&inner.persisted);
        info!(user_id, "two-factor enrollment completed");
        (true, "enrolled")
    }

    pub fn cancel_enrollment(&self, user_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.persisted.enrollments.remove(user_id).is_some();
        if removed {
            self.save(&inner.persisted);
        }
        removed
    }

    pub fn enrollment_status(&self, user_id: &str) -> EnrollmentStatus {
        let now = now_secs();
        let inner = self.inner.lock().unwrap();
        let pending = inner
            .persisted
            .enrollments
            .get(user_id)
            .filter(|e| e.expires_at > now);
        EnrollmentStatus {
            configured: inner.persisted.secrets.contains_key(user_id),
            pending: pending.is_some(),
            pending_expires_at: pending.map(|e| e.expires_at),
        }
    }

    /// True once the user has a bound secret.
    pub fn has_secret(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .persisted
            .secrets
            .contains_key(user_id)
    }

    // ── pending code input ─────────────────────────────────────

    /// Arm the "next message must be a 6-digit code" mode for a user.
    pub fn set_pending_approval_input(&self, user_id: &str, challenge_id: &str, retry_cmd: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.persisted.pending_input.insert(
            user_id.to_string(),
            PendingInput {
                challenge_id: challenge_id.to_string(),
                retry_cmd: retry_cmd.to_string(),
                created_at: now_secs(),
            },
        );
        self.save(&inner.persisted);
    }

    pub fn get_pending_approval_input(&self, user_id: &str) -> Option<PendingInput> {
        self.inner
            .lock()
            .unwrap()
            .persisted
            .pending_input
            .get(user_id)
            .cloned()
    }

    /// Approve the pending challenge with `code`. On success the pending
    /// state is consumed and `(retry_cmd, challenge_id)` is returned so
    /// the caller can replay the original command.
    pub fn approve_pending_input_code(
        &self,
        user_id: &str,
        code: &str,
    ) -> (bool, &'static str, Option<PendingInput>) {
        let pending = match self.get_pending_approval_input(user_id) {
            Some(p) => p,
            None => return (false, "pending_input_not_found", None),
        };
        let (ok, reason) = self.approve_challenge(&pending.challenge_id, user_id, code, None);
        if !ok {
            return (false, reason, None);
        }
        // Consume the pending state; the challenge stays approved for the
        // replayed command to consume.
        let mut inner = self.inner.lock().unwrap();
        inner.persisted.pending_input.remove(user_id);
        self.save(&inner.persisted);
        (true, "approved", Some(pending))
    }

    /// Drop the pending state; with `revoke_challenge` the underlying
    /// challenge is invalidated too (non-code reply path).
    pub fn clear_pending_approval_input(&self, user_id: &str, revoke_challenge: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.persisted.pending_input.remove(user_id) {
            if revoke_challenge {
                inner.challenges.remove(&pending.challenge_id);
                warn!(user_id, challenge_id = %pending.challenge_id, "pending 2FA input cleared, challenge revoked");
            }
            self.save(&inner.persisted);
        }
    }

    // ── approval windows ───────────────────────────────────────

    fn window_key(user_id: &str, channel: &str, chat_id: &str) -> String {
        format!("{user_id}|{channel}|{chat_id}")
    }

    /// Open a chat-scoped grace window that lets follow-up privileged ops
    /// skip re-challenge for a bounded time.
    pub fn activate_approval_window(
        &self,
        user_id: &str,
        channel: &str,
        chat_id: &str,
        ttl_seconds: Option<u64>,
    ) -> ApprovalWindow {
        let now = now_secs();
        let ttl = ttl_seconds.unwrap_or(self.approval_grace_seconds).max(1);
        let window = ApprovalWindow {
            created_at: now,
            expires_at: now + ttl as f64,
            ttl_seconds: ttl,
        };
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);
        inner
            .approval_windows
            .insert(Self::window_key(user_id, channel, chat_id), window.clone());
        window
    }

    pub fn get_approval_window(
        &self,
        user_id: &str,
        channel: &str,
        chat_id: &str,
    ) -> Option<ApprovalWindow> {
        let now = now_secs();
        let mut inner = self.inner.lock().unwrap();
        Self::reap(&mut inner, now);
        inner
            .approval_windows
            .get(&Self::window_key(user_id, channel, chat_id))
            .cloned()
    }

    pub fn clear_approval_window(&self, user_id: &str, channel: &str, chat_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .approval_windows
            .remove(&Self::window_key(user_id, channel, chat_id));
    }

    /// Directly install a secret (tests and bootstrap tooling).
    pub fn set_secret(&self, user_id: &str, secret: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .persisted
            .secrets
            .insert(user_id.to_string(), secret.to_string());
        self.save(&inner.persisted);
    }
}
