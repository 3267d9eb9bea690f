//! Memory management command: /memory.

use kapy_core::Result;
use kapy_memory::MemoryStore;

use crate::pipeline::Context;

fn disabled_text() -> &'static str {
    "❌ 记忆系统未启用（请在配置中开启 memory.enabled）"
}

fn pct(value: f64) -> String {
    format!("{:.1}%", value.max(0.0) * 100.0)
}

fn summary_preview(text: &str) -> String {
    text.chars().take(100).collect()
}

pub async fn handle_memory(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(memory) = deps.memory.clone().filter(|m| m.enabled) else {
        ctx.reply(disabled_text()).await;
        return Ok(());
    };

    let text = ctx.message.text.trim().to_string();
    let parts: Vec<String> = text.split_whitespace().map(|s| s.to_string()).collect();
    if parts.len() == 1 {
        return show_overview(ctx, &memory).await;
    }

    let sub = parts[1].to_lowercase();
    match sub.as_str() {
        "list" => handle_list(ctx, &memory, &parts).await,
        "find" => handle_find(ctx, &memory, &parts).await,
        "show" => handle_show(ctx, &memory, &parts).await,
        "note" => handle_note(ctx, &memory, &parts).await,
        "pin" | "unpin" => handle_pin(ctx, &memory, &parts, sub == "pin").await,
        "forget" => handle_forget(ctx, &memory, &parts).await,
        "fb" | "feedback" => handle_feedback(ctx, &memory, &parts).await,
        "metrics" | "stats" => handle_metrics(ctx, &memory, &parts).await,
        "share" | "skills" => {
            ctx.reply("❌ 跨用户共享已禁用").await;
            Ok(())
        }
        _ => {
            ctx.reply("❌ 未知子命令，发送 /memory 查看帮助").await;
            Ok(())
        }
    }
}

async fn show_overview(ctx: &mut Context, memory: &MemoryStore) -> Result<()> {
    let stats = memory.user_stats(&ctx.user_id);
    let lines = [
        "🧠 记忆系统".to_string(),
        format!("- my_items: <code>{}</code>", stats.user_items),
        format!("- vector_supported: <code>{}</code>", stats.vector_supported),
        "".to_string(),
        "用法：".to_string(),
        "memory list [short|mid|long|all] [limit]".to_string(),
        "memory find <query>".to_string(),
        "memory show <id>".to_string(),
        "memory note <text>".to_string(),
        "memory pin <id>".to_string(),
        "memory unpin <id>".to_string(),
        "memory forget <id>".to_string(),
        "memory fb <request_id> <good|bad> [note]".to_string(),
        "memory metrics [days]".to_string(),
    ];
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

async fn handle_list(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let tier = parts.get(2).map(|t| t.to_lowercase());
    let limit = parts
        .get(3)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(15)
        .clamp(1, 50);
    let rows = memory.list_memories(&ctx.user_id, tier.as_deref(), limit);
    if rows.is_empty() {
        ctx.reply("暂无记忆").await;
        return Ok(());
    }
    let mut lines = vec![format!(
        "📚 记忆列表（tier={}）",
        tier.as_deref().unwrap_or("all")
    )];
    for row in &rows {
        let flag = if row.pinned { "📌" } else { "-" };
        lines.push(format!(
            "{flag} #{} ({}|{}/{}) {}",
            row.memory_id,
            row.tier,
            row.domain,
            row.topic,
            summary_preview(&row.summary)
        ));
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

async fn handle_find(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let query = parts[2..].join(" ");
    if query.is_empty() {
        ctx.reply("用法: /memory find <query>").await;
        return Ok(());
    }
    let session_id = ctx.session.as_ref().map(|s| s.session_id.clone());
    let (rows, req_id) = memory
        .search_memories_with_event(
            &ctx.user_id,
            &query,
            session_id.as_deref(),
            Some(&ctx.message.channel),
            8,
            0.2,
        )
        .await;
    if rows.is_empty() {
        let text = match req_id {
            None => "未检索到相关记忆".to_string(),
            Some(id) => format!(
                "未检索到相关记忆\n- request_id: <code>{id}</code>（可反馈：/memory fb {id} bad）"
            ),
        };
        ctx.reply(&text).await;
        return Ok(());
    }
    let mut lines = vec![format!("🔎 检索结果: {query}")];
    if let Some(id) = req_id {
        lines.push(format!("- request_id: <code>{id}</code>"));
    }
    for row in &rows {
        lines.push(format!(
            "- #{} ({}|{}/{}|score={:.3}) {}",
            row.memory_id,
            row.tier,
            row.domain,
            row.topic,
            row.score,
            summary_preview(&row.summary)
        ));
    }
    if let Some(id) = req_id {
        lines.push(format!("- 反馈: /memory fb {id} good|bad [note]"));
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

async fn handle_show(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let Some(memory_id) = parts.get(2).and_then(|v| v.parse::<i64>().ok()) else {
        ctx.reply("用法: /memory show <id>").await;
        return Ok(());
    };
    let Some(row) = memory.get_memory(&ctx.user_id, memory_id) else {
        ctx.reply("❌ 记忆不存在或无权限").await;
        return Ok(());
    };
    let content: String = row.content.chars().take(1800).collect();
    let lines = [
        format!("🧾 记忆 #{}", row.memory_id),
        format!("- tier: <code>{}</code>", row.tier),
        format!("- type: <code>{}</code>", row.memory_type),
        format!("- tree: <code>{}/{}/{}</code>", row.domain, row.topic, row.item),
        format!("- pinned: <code>{}</code>", row.pinned),
        format!("- summary: {}", row.summary),
        "".to_string(),
        content,
    ];
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

async fn handle_note(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let payload = parts[2..].join(" ");
    if payload.is_empty() {
        ctx.reply("用法: /memory note <text>").await;
        return Ok(());
    }
    let scope_id = ctx.deps.scope_id(&ctx.message);
    let session_id = ctx.session.as_ref().map(|s| s.session_id.clone());
    match memory
        .add_note(
            &ctx.user_id,
            &scope_id,
            session_id.as_deref(),
            &ctx.message.channel,
            &payload,
        )
        .await
    {
        Some(id) => ctx.reply(&format!("✅ 已保存记忆 #{id}")).await,
        None => ctx.reply("❌ 写入失败（可能命中敏感信息规则）").await,
    }
    Ok(())
}

async fn handle_pin(
    ctx: &mut Context,
    memory: &MemoryStore,
    parts: &[String],
    pinned: bool,
) -> Result<()> {
    let sub = if pinned { "pin" } else { "unpin" };
    let Some(memory_id) = parts.get(2).and_then(|v| v.parse::<i64>().ok()) else {
        ctx.reply(&format!("用法: /memory {sub} <id>")).await;
        return Ok(());
    };
    if memory.set_pinned(&ctx.user_id, memory_id, pinned) {
        ctx.reply("✅ 已更新").await;
    } else {
        ctx.reply("❌ 操作失败（记忆不存在或无权限）").await;
    }
    Ok(())
}

async fn handle_forget(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let Some(memory_id) = parts.get(2).and_then(|v| v.parse::<i64>().ok()) else {
        ctx.reply("用法: /memory forget <id>").await;
        return Ok(());
    };
    if memory.forget_memory(&ctx.user_id, memory_id) {
        ctx.reply("✅ 已删除").await;
    } else {
        ctx.reply("❌ 删除失败（记忆不存在或无权限）").await;
    }
    Ok(())
}

async fn handle_feedback(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let retrieval_id = parts.get(2).and_then(|v| v.parse::<i64>().ok());
    let feedback = parts.get(3).map(|v| v.to_lowercase());
    let (Some(retrieval_id), Some(feedback)) = (retrieval_id, feedback) else {
        ctx.reply("用法: /memory fb <request_id> <good|bad> [note]").await;
        return Ok(());
    };
    let note = if parts.len() >= 5 {
        Some(parts[4..].join(" "))
    } else {
        None
    };
    if memory.record_retrieval_feedback(&ctx.user_id, retrieval_id, &feedback, note.as_deref()) {
        ctx.reply("✅ 已记录反馈").await;
    } else {
        ctx.reply("❌ 反馈失败（request_id 不存在、无权限或反馈值非法）")
            .await;
    }
    Ok(())
}

async fn handle_metrics(ctx: &mut Context, memory: &MemoryStore, parts: &[String]) -> Result<()> {
    let days = parts
        .get(2)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(7)
        .clamp(1, 90);
    let stats = memory.retrieval_stats(&ctx.user_id, days);
    let mut lines = vec![
        format!("📈 记忆检索指标（近 {days} 天）"),
        format!("- total_queries: <code>{}</code>", stats.total_queries),
        format!("- hit_rate: <code>{}</code>", pct(stats.hit_rate)),
        format!("- context_inject_rate: <code>{}</code>", pct(stats.context_inject_rate)),
        format!("- avg_result_count: <code>{:.2}</code>", stats.avg_result_count),
        format!("- avg_latency_ms: <code>{:.1}</code>", stats.avg_latency_ms),
        format!("- vector_usage_rate: <code>{}</code>", pct(stats.vector_usage_rate)),
        format!("- feedback_coverage: <code>{}</code>", pct(stats.feedback_coverage)),
        format!("- positive_feedback_rate: <code>{}</code>", pct(stats.positive_feedback_rate)),
    ];
    let recent = memory.recent_retrieval_events(&ctx.user_id, 5);
    if !recent.is_empty() {
        lines.push("".to_string());
        lines.push("最近请求：".to_string());
        for ev in &recent {
            let fb = ev.feedback.as_deref().unwrap_or("-");
            let query: String = ev.query.chars().take(40).collect();
            lines.push(format!(
                "- req#{} hits={} inj={} fb={fb} q={query}",
                ev.retrieval_id, ev.result_count, ev.context_injected
            ));
        }
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}
