//! Agent command: /agent.

use kapy_agent::AgentAdapter;
use kapy_core::Result;
use tracing::warn;

use crate::pipeline::Context;

pub async fn handle_agent(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let scope_id = deps.scope_id(&ctx.message);
    let parts: Vec<String> = ctx
        .message
        .text
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();

    if parts.len() < 2 {
        let current_pref = deps.preferred_agent(&ctx.user_id, &scope_id);
        let current_session = deps.sessions.get_active_session(&ctx.user_id);
        let mut lines = vec![
            "<b>Agent 信息：</b>".to_string(),
            format!("默认: {}", deps.default_agent),
            format!("当前偏好: {current_pref}"),
        ];
        if let Some(session) = current_session {
            lines.push(format!(
                "活跃会话: {} ({})",
                session.agent_name, session.session_id
            ));
        }
        let available: Vec<&str> = deps.agents.keys().map(|k| k.as_str()).collect();
        lines.push(format!("\n可用 agents: {}", available.join(", ")));
        lines.push("用法: /agent &lt;name&gt;".to_string());
        ctx.reply(&lines.join("\n")).await;
        return Ok(());
    }

    let agent_name = parts[1].trim().to_lowercase();
    let Some(target) = deps.agents.get(&agent_name).cloned() else {
        let available: Vec<&str> = deps.agents.keys().map(|k| k.as_str()).collect();
        ctx.reply(&format!(
            "❌ 未找到 agent: {agent_name}。可用: {}",
            available.join(", ")
        ))
        .await;
        return Ok(());
    };

    deps.set_agent_pref(&ctx.user_id, &scope_id, &agent_name);

    // Create and activate a session immediately so the next message does
    // not pay the creation latency.
    let info = match target
        .create_session(&ctx.user_id, &ctx.message.chat_id, None)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(agent = %agent_name, error = %e, "failed to create session after /agent switch");
            ctx.reply(&format!(
                "✅ 已切换到 {agent_name}，但创建会话失败，请发送下一条消息重试"
            ))
            .await;
            return Ok(());
        }
    };

    let agent_cfg = deps.config.agents.get(&agent_name);
    let model = deps
        .take_model_pref(&ctx.user_id)
        .or_else(|| agent_cfg.and_then(|c| c.default_model.clone()));
    let params = agent_cfg
        .map(|c| c.default_params.clone())
        .unwrap_or_default();
    let managed = deps.sessions.create_session(
        &ctx.user_id,
        &ctx.message.chat_id,
        &scope_id,
        &agent_name,
        Some(info.session_id),
        model,
        params,
    );
    ctx.reply(&format!(
        "✅ 已切换到 {agent_name}，当前会话: <code>{}</code>",
        managed.session_id
    ))
    .await;
    Ok(())
}
