//! Utility commands: /start, /help, /whoami, /history, /cancel.

use kapy_agent::AgentAdapter;
use kapy_core::runtime::to_external_mode;
use kapy_core::Result;

use crate::pipeline::Context;

pub async fn handle_start(ctx: &mut Context) -> Result<()> {
    ctx.reply("👋 CLI Gateway 已启动，发送 /help 查看命令。").await;
    Ok(())
}

pub async fn handle_help(ctx: &mut Context) -> Result<()> {
    let lines = [
        "📚 可用命令：",
        "",
        "💡 <b>两种格式</b>",
        "• 传统: <code>/model opus</code>",
        "• 新格式: <code>kapy model opus</code>",
        "",
        "<b>会话管理</b>",
        "agent [&lt;name&gt;] - 切换 agent 或查看当前 agent",
        "sessions - 列出所有会话",
        "current - 查看当前会话",
        "switch &lt;id&gt; - 切换到指定会话",
        "kill - 销毁当前会话",
        "name &lt;label&gt; - 为当前会话命名",
        "cancel - 取消当前执行",
        "history - 查看对话历史",
        "whoami - 查看当前身份与运行模式",
        "",
        "<b>模型配置</b>",
        "model [&lt;alias&gt;] - 切换模型或查看可用模型",
        "param [&lt;key&gt; &lt;value&gt;] - 设置参数或查看可用参数",
        "params - 查看当前配置",
        "reset - 重置为默认配置",
        "",
        "<b>文件管理</b>",
        "files - 列出当前会话输出文件",
        "download &lt;filename&gt; - 下载文件",
        "",
        "<b>记忆管理</b>",
        "memory - 长期记忆（list/find/show/note/pin/forget/fb/metrics）",
        "",
        "<b>系统审批（system 模式）</b>",
        "sudo status - 查看 sudo 开关状态",
        "sudo on - 触发 2FA，验证通过后 10 分钟 root 执行",
        "sudo off - 立即关闭 sudo",
        "sysauth plan &lt;action&gt; - 创建 2FA 审批请求",
        "sysauth approve &lt;id&gt; &lt;code&gt; - 提交 TOTP 审批",
        "sysauth status &lt;id&gt; - 查看审批状态",
        "sysauth setup start - 开始绑定 2FA",
        "sysauth setup verify &lt;code&gt; - 提交绑定验证码并保存",
        "sysauth setup status - 查看绑定状态",
        "sysauth setup cancel - 取消绑定会话",
        "",
        "<b>示例</b>",
        "<code>kapy model opus</code>",
        "<code>kapy param thinking high</code>",
        "<code>kapy whoami</code>",
    ];
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_whoami(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let mode = to_external_mode(&deps.config.runtime.mode);
    let is_admin = deps.auth.is_admin(&ctx.user_id);
    let is_system_admin = deps.auth.is_system_admin(&ctx.user_id);

    let mut lines = vec![
        "🪪 当前身份信息".to_string(),
        format!("- user_id: <code>{}</code>", ctx.user_id),
        format!("- mode: <code>{mode}</code>"),
        format!("- admin: <code>{is_admin}</code>"),
        format!("- system_admin: <code>{is_system_admin}</code>"),
    ];
    if deps.in_system_mode() {
        let status = deps.sudo_status(&ctx.user_id, &ctx.message.channel, &ctx.message.chat_id);
        let state = if status.enabled { "on" } else { "off" };
        lines.push(format!("- sudo: <code>{state}</code>"));
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_history(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    // History resolves via the per-user pointer.
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let history = deps.sessions.get_history(&current.session_id);
    if history.is_empty() {
        ctx.reply("暂无对话历史").await;
        return Ok(());
    }
    let mut lines = vec!["📜 对话历史：".to_string()];
    let start = history.len().saturating_sub(10);
    for entry in &history[start..] {
        let marker = if entry.role == "user" { "👤" } else { "🤖" };
        let content: String = entry.content.chars().take(100).collect();
        lines.push(format!("{marker} {content}"));
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_cancel(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    // Cancel resolves via the per-user pointer.
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let Some(agent) = deps.agents.get(&current.agent_name).cloned() else {
        ctx.reply("❌ Agent 不可用").await;
        return Ok(());
    };
    let busy = agent
        .get_session_info(&current.session_id)
        .map(|info| info.is_busy)
        .unwrap_or(false);
    if !busy {
        ctx.reply("当前无正在执行的任务").await;
        return Ok(());
    }
    // Signal the delivery loop first, then kill the child.
    if let Some(token) = deps.peek_cancel_token(&current.session_id) {
        token.cancel();
    }
    let _ = agent.cancel(&current.session_id).await;
    ctx.reply("✅ 已取消当前操作").await;
    Ok(())
}
