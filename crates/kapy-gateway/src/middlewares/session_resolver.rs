//! Session resolution: ensure an active managed session exists for the
//! scope, creating or recovering one as needed.

use async_trait::async_trait;
use kapy_agent::AgentAdapter;
use kapy_core::Result;
use kapy_sessions::ManagedSession;
use tracing::{info, warn};

use crate::pipeline::{Context, Middleware, Next};

pub struct SessionResolver;

#[async_trait]
impl Middleware for SessionResolver {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        let Some(current) = ensure_session(ctx).await else {
            return Ok(());
        };

        let Some(agent) = ctx.deps.agents.get(&current.agent_name).cloned() else {
            ctx.reply(&format!("❌ Agent 不存在: {}", current.agent_name))
                .await;
            return Ok(());
        };

        let current = recover_stale_session(ctx, &agent, current).await;

        ctx.session = Some(current);
        ctx.agent = Some(agent);
        next.run(ctx).await
    }
}

/// Resolve or create the active session for `(user, scope)`.
async fn ensure_session(ctx: &mut Context) -> Option<ManagedSession> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);

    let mut current = None;
    if ctx.message.channel == "email" {
        if let Some(hint) = ctx.message.session_hint.clone() {
            match deps.sessions.get_session(&hint) {
                Some(hinted) if hinted.user_id == ctx.user_id => {
                    deps.sessions.switch_session(&ctx.user_id, &hint);
                    info!(session_id = %hint, "email session resumed via hint");
                    current = Some(hinted);
                }
                _ => {
                    warn!(hint = %hint, "email session hint not found or unauthorized, creating new");
                }
            }
        }
    } else {
        current = deps.sessions.get_active_session_for_scope(&scope_id);
    }

    if let Some(session) = current {
        return Some(session);
    }

    // Lazy creation on first message.
    let agent_name = deps.preferred_agent(&ctx.user_id, &scope_id);
    let Some(agent) = deps.agents.get(&agent_name).cloned() else {
        let available: Vec<&str> = deps.agents.keys().map(|k| k.as_str()).collect();
        ctx.reply(&format!(
            "❌ Agent 不可用: {agent_name}，可用: {}",
            available.join(", ")
        ))
        .await;
        return None;
    };

    let info = match agent
        .create_session(&ctx.user_id, &ctx.message.chat_id, None)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(agent = %agent_name, error = %e, "failed to create agent session");
            ctx.reply("❌ 会话创建失败，请稍后重试").await;
            return None;
        }
    };

    let agent_cfg = deps.config.agents.get(&agent_name);
    let model = deps
        .take_model_pref(&ctx.user_id)
        .or_else(|| agent_cfg.and_then(|c| c.default_model.clone()));
    let params = agent_cfg
        .map(|c| c.default_params.clone())
        .unwrap_or_default();

    Some(deps.sessions.create_session(
        &ctx.user_id,
        &ctx.message.chat_id,
        &scope_id,
        &agent_name,
        Some(info.session_id),
        model,
        params,
    ))
}

/// If the adapter lost the session (e.g. after a restart), recreate it
/// preserving the session id, model, and params.
async fn recover_stale_session(
    ctx: &Context,
    agent: &std::sync::Arc<dyn kapy_agent::AgentAdapter>,
    current: ManagedSession,
) -> ManagedSession {
    if agent.get_session_info(&current.session_id).is_some() {
        return current;
    }
    let deps = &ctx.deps;
    info!(session_id = %current.session_id, "recovering stale session, recreating in adapter");

    match agent
        .create_session(
            &current.user_id,
            &current.chat_id,
            Some(&current.session_id),
        )
        .await
    {
        Ok(_) => current,
        Err(e) => {
            // Recreation with the original id failed; fall back to a fresh
            // managed session carrying the old model/params forward.
            warn!(session_id = %current.session_id, error = %e, "adapter refused stale id, rebuilding session");
            let old_model = current.model.clone();
            let old_params = current.params.clone();
            deps.sessions.destroy_session(&current.session_id);
            deps.pop_session_lock(&current.session_id);
            match agent
                .create_session(&current.user_id, &current.chat_id, None)
                .await
            {
                Ok(info) => deps.sessions.create_session(
                    &current.user_id,
                    &current.chat_id,
                    &current.scope_id,
                    &current.agent_name,
                    Some(info.session_id),
                    old_model,
                    old_params,
                ),
                Err(_) => current,
            }
        }
    }
}
