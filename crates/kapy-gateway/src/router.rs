//! Message router — wires components, owns per-session locks and cancel
//! tokens, and hosts the helpers middlewares and commands share.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use kapy_agent::AgentAdapter;
use kapy_auth::AuthManager;
use kapy_billing::{BillingLog, BillingRecord};
use kapy_channels::{Channel, IncomingMessage};
use kapy_core::config::KapyConfig;
use kapy_core::formatter::OutputFormatter;
use kapy_core::rules::RulesLoader;
use kapy_core::MAX_ATTACHMENT_SIZE_BYTES;
use kapy_memory::MemoryStore;
use kapy_privileged::{SudoStateManager, SystemGrantManager, SystemServiceClient, TwoFactorManager};
use kapy_sessions::{build_scope_id, ManagedSession, SessionStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::email_cache::ReplySessionCache;
use crate::pipeline::{Context, Pipeline};

/// Shared component bundle injected into every request context.
pub struct Deps {
    pub config: KapyConfig,
    pub auth: Arc<AuthManager>,
    pub sessions: Arc<SessionStore>,
    pub agents: HashMap<String, Arc<dyn AgentAdapter>>,
    pub channel: Arc<dyn Channel>,
    pub billing: Option<Arc<BillingLog>>,
    pub memory: Option<Arc<MemoryStore>>,
    pub two_factor: Option<Arc<TwoFactorManager>>,
    pub sudo: Arc<SudoStateManager>,
    pub system_client: Option<Arc<SystemServiceClient>>,
    pub grants: Option<Arc<SystemGrantManager>>,
    pub rules: RulesLoader,
    pub formatter: OutputFormatter,
    pub default_agent: String,
    pub version: String,

    // Router-owned mutable state.
    session_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cancel_tokens: DashMap<String, CancellationToken>,
    user_agent_pref: DashMap<String, String>,
    scope_agent_pref: DashMap<String, String>,
    user_model_pref: DashMap<String, String>,
    email_replies: Mutex<ReplySessionCache>,
}

/// Convert lightweight HTML markup to channel-appropriate text.
/// Telegram consumes the HTML as-is; other channels get markdown.
pub fn fmt_for_channel(channel: &str, text: &str) -> String {
    if channel == "telegram" {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    // <b>..</b> → **..**, <code>..</code> → `..`
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let replaced = [("<b>", "**"), ("</b>", "**"), ("<code>", "`"), ("</code>", "`"), ("<pre>", ""), ("</pre>", "")]
            .iter()
            .find(|(tag, _)| tail.starts_with(tag));
        match replaced {
            Some((tag, repl)) => {
                out.push_str(repl);
                rest = &tail[tag.len()..];
            }
            None => {
                out.push('<');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

impl Deps {
    /// Get or create the per-session mutex.
    pub fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn pop_session_lock(&self, session_id: &str) {
        self.session_locks.remove(session_id);
    }

    /// Fresh cancel token for a turn (replaces any previous one).
    pub fn new_cancel_token(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens
            .insert(session_id.to_string(), token.clone());
        token
    }

    /// Existing cancel token, if a turn is (or was) in flight.
    pub fn peek_cancel_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.cancel_tokens.get(session_id).map(|t| t.clone())
    }

    pub fn pop_cancel_token(&self, session_id: &str) {
        self.cancel_tokens.remove(session_id);
    }

    // ── preferences ───────────────────────────────────────────

    /// Preferred agent for a scope, falling back to the user preference,
    /// then the configured default.
    pub fn preferred_agent(&self, user_id: &str, scope_id: &str) -> String {
        if let Some(pref) = self.scope_agent_pref.get(scope_id) {
            return pref.clone();
        }
        if let Some(pref) = self.user_agent_pref.get(user_id) {
            return pref.clone();
        }
        self.default_agent.clone()
    }

    pub fn scope_agent(&self, scope_id: &str) -> String {
        self.scope_agent_pref
            .get(scope_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_agent.clone())
    }

    pub fn set_agent_pref(&self, user_id: &str, scope_id: &str, agent: &str) {
        self.user_agent_pref
            .insert(user_id.to_string(), agent.to_string());
        self.scope_agent_pref
            .insert(scope_id.to_string(), agent.to_string());
    }

    /// Queue a model preference consumed by the next session creation.
    pub fn set_model_pref(&self, user_id: &str, model: &str) {
        self.user_model_pref
            .insert(user_id.to_string(), model.to_string());
    }

    pub fn take_model_pref(&self, user_id: &str) -> Option<String> {
        self.user_model_pref.remove(user_id).map(|(_, v)| v)
    }

    // ── scope / mode helpers ──────────────────────────────────

    pub fn scope_id(&self, message: &IncomingMessage) -> String {
        build_scope_id(message)
    }

    pub fn in_system_mode(&self) -> bool {
        kapy_core::runtime::is_system_mode(&self.config.runtime.mode)
    }

    // ── sudo ──────────────────────────────────────────────────

    pub fn sudo_status(&self, user_id: &str, channel: &str, chat_id: &str) -> kapy_privileged::sudo::SudoStatus {
        self.sudo.status(user_id, channel, chat_id)
    }

    pub fn enable_sudo(&self, message: &IncomingMessage, ttl_seconds: u64) -> kapy_privileged::sudo::SudoStatus {
        self.sudo.enable(
            &message.user_id,
            &message.channel,
            &message.chat_id,
            Some(ttl_seconds),
        )
    }

    pub fn disable_sudo(&self, message: &IncomingMessage) -> bool {
        self.sudo
            .disable(&message.user_id, &message.channel, &message.chat_id)
    }

    pub fn is_sudo_enabled(&self, message: &IncomingMessage) -> bool {
        self.sudo
            .is_enabled(&message.user_id, &message.channel, &message.chat_id)
    }

    // ── email reply threading ─────────────────────────────────

    pub fn set_reply_session(&self, chat_id: &str, session_id: &str) {
        self.email_replies.lock().unwrap().set(chat_id, session_id);
    }

    pub fn reply_session(&self, chat_id: &str) -> Option<String> {
        self.email_replies.lock().unwrap().get(chat_id)
    }

    // ── prompt assembly ───────────────────────────────────────

    /// Build the final prompt: attachment filtering/copying, channel
    /// context, sender context, and memory context.
    pub async fn prepare_prompt(
        &self,
        message: &mut IncomingMessage,
        agent: &Arc<dyn AgentAdapter>,
        session: &ManagedSession,
    ) -> String {
        let mut prompt = message.text.clone();

        // Reject oversized attachments with a per-file warning.
        if !message.attachments.is_empty() {
            let mut rejected = Vec::new();
            let mut accepted = Vec::new();
            for att in message.attachments.drain(..) {
                if att.size_bytes > MAX_ATTACHMENT_SIZE_BYTES {
                    rejected.push(format!(
                        "{} ({}MB)",
                        att.filename,
                        att.size_bytes / 1024 / 1024
                    ));
                } else {
                    accepted.push(att);
                }
            }
            if !rejected.is_empty() {
                let limit_mb = MAX_ATTACHMENT_SIZE_BYTES / 1024 / 1024;
                let warning = format!(
                    "⚠️ 以下附件超过 {limit_mb}MB 限制，已跳过：\n{}",
                    rejected
                        .iter()
                        .map(|r| format!("- {r}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                let _ = self.channel.send_text(&message.chat_id, &warning).await;
            }
            message.attachments = accepted;
        }

        // Copy accepted attachments into the session's user/ directory.
        if !message.attachments.is_empty() {
            if let Some(info) = agent.get_session_info(&session.session_id) {
                let user_dir = kapy_agent::workspace::user_upload_dir(&info.work_dir);
                let mut att_lines = Vec::new();
                for att in &message.attachments {
                    let dest = kapy_agent::workspace::safe_filename(&user_dir, &att.filename);
                    match std::fs::copy(&att.filepath, &dest) {
                        Ok(_) => {
                            att_lines.push(format!(
                                "- {} ({}, {} bytes)",
                                att.filename, att.mime_type, att.size_bytes
                            ));
                            att_lines.push(format!("  Path: {}", dest.display()));
                        }
                        Err(e) => {
                            warn!(filename = %att.filename, error = %e, "failed to copy attachment");
                            att_lines.push(format!(
                                "- {} ({}, {} bytes)",
                                att.filename, att.mime_type, att.size_bytes
                            ));
                            att_lines.push(format!("  Path: {}", att.filepath));
                        }
                    }
                }
                let att_info = att_lines.join("\n");
                prompt = if prompt.is_empty() {
                    format!("附件:\n{att_info}")
                } else {
                    format!("{prompt}\n\n附件:\n{att_info}")
                };
            }
        }

        if prompt.is_empty() {
            return prompt;
        }

        let channel_context = self.rules.system_prompt(&message.channel);
        let sender_context = format!(
            "[SENDER CONTEXT]\n\
             - sender_user_id: {}\n\
             - sender_username: {}\n\
             - sender_display_name: {}\n\
             - sender_mention_token: {}\n\
             - Reply behavior constraint: start replies by mentioning the sender. \
             If the task semantics clearly require notifying additional people, mention them too.\n\
             [END SENDER CONTEXT]\n\n",
            message.user_id,
            message.sender_username.as_deref().unwrap_or("unknown"),
            message.sender_display_name.as_deref().unwrap_or("unknown"),
            message.sender_mention.as_deref().unwrap_or("unknown"),
        );

        let memory_context = match &self.memory {
            Some(memory) if memory.enabled => {
                memory
                    .build_memory_context(
                        &message.user_id,
                        &message.text,
                        Some(&session.session_id),
                        Some(&message.channel),
                    )
                    .await
            }
            _ => String::new(),
        };

        format!("{memory_context}{channel_context}{sender_context}{prompt}")
    }

    /// Record billing after a delivered turn, if configured.
    pub fn record_usage(
        &self,
        message: &IncomingMessage,
        agent: &Arc<dyn AgentAdapter>,
        session: &ManagedSession,
    ) {
        let Some(billing) = &self.billing else {
            return;
        };
        let Some(usage) = agent.get_last_usage(&session.session_id) else {
            return;
        };
        billing.record(BillingRecord {
            session_id: session.session_id.clone(),
            user_id: message.user_id.clone(),
            channel: message.channel.clone(),
            agent: session.agent_name.clone(),
            model: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost_usd: usage.cost_usd,
            duration_ms: usage.duration_ms,
        });
    }
}

/// Route incoming messages through the middleware pipeline.
pub struct Router {
    deps: Arc<Deps>,
    pipeline: Pipeline,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: KapyConfig,
        auth: Arc<AuthManager>,
        sessions: Arc<SessionStore>,
        agents: HashMap<String, Arc<dyn AgentAdapter>>,
        channel: Arc<dyn Channel>,
        billing: Option<Arc<BillingLog>>,
        memory: Option<Arc<MemoryStore>>,
        two_factor: Option<Arc<TwoFactorManager>>,
        system_client: Option<Arc<SystemServiceClient>>,
        grants: Option<Arc<SystemGrantManager>>,
    ) -> Self {
        let configured_default = config.default_agent.clone();
        let default_agent = if agents.contains_key(&configured_default) {
            configured_default
        } else {
            let fallback = agents.keys().next().cloned().unwrap_or_default();
            warn!(
                configured = %config.default_agent,
                fallback = %fallback,
                "configured default_agent not available, falling back"
            );
            fallback
        };

        let version = kapy_core::runtime::resolve_version(std::path::Path::new(".runtime-version"));
        let sudo = Arc::new(SudoStateManager::new(config.sudo.ttl_seconds));
        let rules = RulesLoader::new(config.rules_dir.clone());
        let formatter = OutputFormatter::new(config.formatter.max_message_length);

        let deps = Arc::new(Deps {
            config,
            auth,
            sessions,
            agents,
            channel,
            billing,
            memory,
            two_factor,
            sudo,
            system_client,
            grants,
            rules,
            formatter,
            default_agent,
            version,
            session_locks: DashMap::new(),
            cancel_tokens: DashMap::new(),
            user_agent_pref: DashMap::new(),
            scope_agent_pref: DashMap::new(),
            user_model_pref: DashMap::new(),
            email_replies: Mutex::new(ReplySessionCache::default()),
        });

        Self {
            pipeline: crate::middlewares::build_pipeline(),
            deps,
        }
    }

    pub fn deps(&self) -> Arc<Deps> {
        Arc::clone(&self.deps)
    }

    /// Handle one normalized incoming message. Never propagates errors;
    /// the outermost catch turns surprises into a friendly reply.
    pub async fn handle_message(&self, message: IncomingMessage) {
        let mut ctx = Context::new(message, Arc::clone(&self.deps));
        if let Err(e) = self.pipeline.execute(&mut ctx).await {
            error!(user_id = %ctx.user_id, error = %e, "unhandled error processing message");
            let _ = self
                .deps
                .channel
                .send_text(&ctx.message.chat_id, "❌ 内部错误，请稍后重试")
                .await;
        }
    }

    /// Periodic stale-session cleanup hook (invoked by the binary).
    pub fn cleanup_inactive_sessions(&self) -> Vec<String> {
        let hours = self.deps.config.sessions.cleanup_inactive_after_hours;
        let removed = self.deps.sessions.cleanup_inactive_sessions(hours);
        for sid in &removed {
            self.deps.pop_session_lock(sid);
            self.deps.pop_cancel_token(sid);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "stale sessions reconciled");
        }
        removed
    }
}
