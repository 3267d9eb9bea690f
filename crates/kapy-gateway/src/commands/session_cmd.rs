//! Session management commands: /sessions, /current, /switch, /kill, /name.

use kapy_agent::AgentAdapter;
use kapy_core::runtime::to_external_mode;
use kapy_core::Result;
use tracing::warn;

use crate::pipeline::Context;

pub async fn handle_sessions(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let sessions = deps.sessions.list_scope_sessions(&scope_id);
    if sessions.is_empty() {
        ctx.reply("暂无会话").await;
        return Ok(());
    }
    let current = deps.sessions.get_active_session_for_scope(&scope_id);
    let mut lines = vec!["你的会话：".to_string()];
    for item in &sessions {
        let marker = if current
            .as_ref()
            .map(|c| c.session_id == item.session_id)
            .unwrap_or(false)
        {
            "⭐"
        } else {
            "-"
        };
        let name_suffix = item
            .name
            .as_ref()
            .map(|n| format!(" [{n}]"))
            .unwrap_or_default();
        lines.push(format!(
            "{marker} {} ({}){name_suffix}",
            item.session_id, item.agent_name
        ));
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_current(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let current = deps.sessions.get_active_session_for_scope(&scope_id);
    let scope_agent = deps.scope_agent(&scope_id);
    let mode = to_external_mode(&deps.config.runtime.mode);
    let version = &deps.version;

    let text = match current {
        None => format!(
            "当前无活跃会话\nAgent: -\n下一条将使用: {scope_agent}\n默认 Agent: {}\n模式: <code>{mode}</code>\n版本: <code>{version}</code>",
            deps.default_agent
        ),
        Some(current) => format!(
            "当前会话: {}\nAgent: {}\n作用域偏好 Agent: {scope_agent}\n模式: <code>{mode}</code>\n版本: <code>{version}</code>",
            current.session_id, current.agent_name
        ),
    };
    ctx.reply(&text).await;
    Ok(())
}

pub async fn handle_switch(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let parts: Vec<&str> = ctx.message.text.split_whitespace().collect();
    if parts.len() < 2 {
        ctx.reply("用法: /switch <session_id>").await;
        return Ok(());
    }
    let session_id = parts[1].trim();
    if !kapy_sessions::id::is_valid_session_id(session_id)
        || !deps.sessions.switch_session_for_scope(&scope_id, session_id)
    {
        ctx.reply("❌ 会话不存在或无权限").await;
        return Ok(());
    }
    ctx.reply(&format!("✅ 已切换到会话 {session_id}")).await;
    Ok(())
}

pub async fn handle_kill(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let Some(current) = deps.sessions.get_active_session_for_scope(&scope_id) else {
        ctx.reply("当前无活跃会话").await;
        return Ok(());
    };
    if let Some(agent) = deps.agents.get(&current.agent_name) {
        if let Err(e) = agent.destroy_session(&current.session_id).await {
            warn!(
                session_id = %current.session_id,
                error = %e,
                "failed to destroy agent session, cleaning up metadata only"
            );
        }
    }
    deps.sessions.destroy_session(&current.session_id);
    deps.pop_session_lock(&current.session_id);
    deps.pop_cancel_token(&current.session_id);
    ctx.reply(&format!("🗑️ 已销毁会话 {}", current.session_id)).await;
    Ok(())
}

pub async fn handle_name(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let Some(current) = deps.sessions.get_active_session_for_scope(&scope_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let parts: Vec<&str> = ctx.message.text.split_whitespace().collect();
    if parts.len() < 2 {
        ctx.reply("用法: /name &lt;label&gt;").await;
        return Ok(());
    }
    let name = parts[1..].join(" ");
    deps.sessions.update_name(&current.session_id, &name);
    ctx.reply(&format!("✅ 会话已命名: {name}")).await;
    Ok(())
}
