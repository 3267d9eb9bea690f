//! Model/parameter commands: /model, /param, /params, /reset.

use kapy_core::Result;

use crate::pipeline::Context;

pub async fn handle_model(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let parts: Vec<String> = ctx
        .message
        .text
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let current = deps.sessions.get_active_session(&ctx.user_id);
    let scope_id = deps.scope_id(&ctx.message);
    let active_agent_name = current
        .as_ref()
        .map(|c| c.agent_name.clone())
        .unwrap_or_else(|| deps.preferred_agent(&ctx.user_id, &scope_id));
    let models = deps
        .config
        .agents
        .get(&active_agent_name)
        .map(|c| c.models.clone())
        .unwrap_or_default();

    if parts.len() < 2 {
        if models.is_empty() {
            ctx.reply("该 agent 无可切换模型").await;
            return Ok(());
        }
        let current_model = current.as_ref().and_then(|c| c.model.clone());
        let mut lines = vec![format!("<b>{active_agent_name} 可用模型：</b>")];
        let mut aliases: Vec<&String> = models.keys().collect();
        aliases.sort();
        for alias in aliases {
            let marker = if current_model.as_deref() == Some(alias.as_str()) {
                "✅"
            } else {
                "-"
            };
            lines.push(format!("{marker} <code>{alias}</code> ({})", models[alias]));
        }
        ctx.reply(&lines.join("\n")).await;
        return Ok(());
    }

    let model_alias = parts[1].trim().to_lowercase();
    let Some(full_name) = models.get(&model_alias) else {
        let mut available: Vec<&str> = models.keys().map(|k| k.as_str()).collect();
        available.sort();
        ctx.reply(&format!(
            "❌ 模型不存在: {model_alias}\n可用: {}",
            available.join(", ")
        ))
        .await;
        return Ok(());
    };

    match current {
        Some(current) => {
            deps.sessions
                .update_model(&current.session_id, Some(model_alias.clone()));
            ctx.reply(&format!("✅ 已切换模型: {model_alias} ({full_name})"))
                .await;
        }
        None => {
            // No session yet: queue the preference for the next one.
            deps.set_model_pref(&ctx.user_id, &model_alias);
            ctx.reply(&format!(
                "✅ 已设置模型偏好: {model_alias} ({full_name})，下次会话生效"
            ))
            .await;
        }
    }
    Ok(())
}

pub async fn handle_param(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let parts: Vec<String> = ctx
        .message
        .text
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let supported = deps
        .config
        .agents
        .get(&current.agent_name)
        .map(|c| c.supported_params.clone())
        .unwrap_or_default();

    if parts.len() < 2 {
        if supported.is_empty() {
            ctx.reply("该 agent 无可配置参数").await;
            return Ok(());
        }
        let mut lines = vec![format!("<b>{} 支持的参数：</b>", current.agent_name)];
        let mut keys: Vec<&String> = supported.keys().collect();
        keys.sort();
        for key in keys {
            let value = current
                .params
                .get(key)
                .cloned()
                .unwrap_or_else(|| "(未设置)".to_string());
            lines.push(format!("- <code>{key}</code>: {value}"));
        }
        lines.push("\n用法: /param &lt;key&gt; &lt;value&gt;".to_string());
        ctx.reply(&lines.join("\n")).await;
        return Ok(());
    }

    if parts.len() < 3 {
        ctx.reply("用法: /param &lt;key&gt; &lt;value&gt;").await;
        return Ok(());
    }

    let key = parts[1].trim();
    let value = parts[2].trim();
    if !supported.contains_key(key) {
        let mut keys: Vec<&str> = supported.keys().map(|k| k.as_str()).collect();
        keys.sort();
        ctx.reply(&format!(
            "❌ {} 不支持参数 {key}\n支持: {}",
            current.agent_name,
            keys.join(", ")
        ))
        .await;
        return Ok(());
    }

    deps.sessions.update_param(&current.session_id, key, value);
    ctx.reply(&format!("✅ 已设置 {key} = {value}")).await;
    Ok(())
}

pub async fn handle_params(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let models = deps
        .config
        .agents
        .get(&current.agent_name)
        .map(|c| c.models.clone())
        .unwrap_or_default();

    let mut lines = vec![
        "<b>当前配置</b>".to_string(),
        format!("会话: <code>{}</code>", current.session_id),
        format!("Agent: {}", current.agent_name),
    ];
    match &current.model {
        Some(alias) => {
            let full = models.get(alias).cloned().unwrap_or_else(|| alias.clone());
            lines.push(format!("模型: <code>{alias}</code> ({full})"));
        }
        None => lines.push("模型: (默认)".to_string()),
    }
    if current.params.is_empty() {
        lines.push("\n参数: (无)".to_string());
    } else {
        lines.push("\n<b>参数：</b>".to_string());
        let mut keys: Vec<&String> = current.params.keys().collect();
        keys.sort();
        for key in keys {
            lines.push(format!("- <code>{key}</code>: {}", current.params[key]));
        }
    }
    ctx.reply(&lines.join("\n")).await;
    Ok(())
}

pub async fn handle_reset(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(current) = deps.sessions.get_active_session(&ctx.user_id) else {
        ctx.reply("❌ 当前无活跃会话").await;
        return Ok(());
    };
    let agent_cfg = deps.config.agents.get(&current.agent_name);
    let default_model = agent_cfg.and_then(|c| c.default_model.clone());
    let default_params = agent_cfg
        .map(|c| c.default_params.clone())
        .unwrap_or_default();

    deps.sessions
        .update_model(&current.session_id, default_model);
    deps.sessions
        .reset_params(&current.session_id, default_params);
    ctx.reply("✅ 已重置为默认配置").await;
    Ok(())
}
