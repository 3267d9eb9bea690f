//! File commands: /files, /download.

use kapy_agent::AgentAdapter;
use kapy_channels::Channel;
use kapy_core::Result;

use crate::pipeline::Context;

pub async fn handle_files(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    // File commands resolve via the per-user pointer.
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let Some(agent) = deps.agents.get(&current.agent_name) else {
        ctx.reply("❌ 会话不可用").await;
        return Ok(());
    };
    let Some(info) = agent.get_session_info(&current.session_id) else {
        ctx.reply("❌ 会话不可用").await;
        return Ok(());
    };

    let ai_dir = kapy_agent::workspace::ai_output_dir(&info.work_dir);
    let mut files: Vec<String> = match std::fs::read_dir(&ai_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    if files.is_empty() {
        ctx.reply("暂无输出文件").await;
        return Ok(());
    }
    files.sort();
    let mut lines = vec!["📁 输出文件：".to_string()];
    for name in files {
        lines.push(format!("- {name}"));
    }
    lines.push("\n使用 /download &lt;filename&gt; 下载".to_string());
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_download(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let parts: Vec<&str> = ctx.message.text.split_whitespace().collect();
    if parts.len() < 2 {
        ctx.reply("用法: /download &lt;filename&gt;").await;
        return Ok(());
    }
    let filename = parts[1].trim();
    let Some(agent) = deps.agents.get(&current.agent_name) else {
        ctx.reply("❌ 会话不可用").await;
        return Ok(());
    };
    let Some(info) = agent.get_session_info(&current.session_id) else {
        ctx.reply("❌ 会话不可用").await;
        return Ok(());
    };

    // Path traversal protection: no separators or parent components, and
    // the resolved path must stay inside ai/.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        ctx.reply("❌ 非法路径").await;
        return Ok(());
    }
    let ai_dir = kapy_agent::workspace::ai_output_dir(&info.work_dir);
    let candidate = ai_dir.join(filename);
    let ai_dir_resolved = ai_dir.canonicalize().unwrap_or(ai_dir.clone());
    let resolved = candidate.canonicalize().unwrap_or(candidate.clone());
    if !resolved.starts_with(&ai_dir_resolved) {
        ctx.reply("❌ 非法路径").await;
        return Ok(());
    }
    if !resolved.is_file() {
        ctx.reply(&format!("❌ 未找到文件: {filename}")).await;
        return Ok(());
    }

    if let Err(e) = deps
        .channel
        .send_file(&ctx.message.chat_id, &resolved.to_string_lossy(), filename)
        .await
    {
        tracing::warn!(error = %e, filename, "file send failed");
        ctx.reply("❌ 文件发送失败").await;
    }
    Ok(())
}
