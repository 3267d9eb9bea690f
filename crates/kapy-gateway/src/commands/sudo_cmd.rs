//! Sudo window command: /sudo {status,on,off}.
//!
//! `/sudo on` opens a 2FA challenge; the user replies with a 6-digit
//! code (handled by the two-factor-reply middleware, which replays
//! `/sudo on --challenge <id>`), and a time-boxed root window opens for
//! this chat.

use kapy_core::Result;
use kapy_privileged::sudo::SudoStatus;
use serde_json::json;

use crate::pipeline::Context;

fn usage() -> String {
    [
        "用法:",
        "• /sudo status",
        "• /sudo on [--challenge <id>]",
        "• /sudo off",
        "",
        "说明:",
        "• 仅 sys 模式可用",
        "• /sudo on 会触发 2FA，直接回复 6 位验证码即可",
        "• 验证通过后 10 分钟内 Agent CLI 以 root 身份执行",
        "• 10 分钟后自动失效，或手动 /sudo off 立即关闭",
    ]
    .join("\n")
}

fn status_text(status: &SudoStatus) -> String {
    if status.enabled {
        format!("on (剩余 {}s)", status.remaining_seconds)
    } else {
        "off".to_string()
    }
}

/// Split `--challenge <id>` out of the argument list.
fn extract_challenge(parts: &[String]) -> std::result::Result<(Vec<String>, Option<String>), String> {
    let mut out = Vec::new();
    let mut challenge_id = None;
    let mut i = 0;
    while i < parts.len() {
        if parts[i] == "--challenge" {
            let Some(id) = parts.get(i + 1) else {
                return Err("--challenge 需要 challenge_id".to_string());
            };
            challenge_id = Some(id.clone());
            i += 2;
            continue;
        }
        out.push(parts[i].clone());
        i += 1;
    }
    Ok((out, challenge_id))
}

fn sudo_action_payload(ctx: &Context) -> serde_json::Value {
    json!({
        "op": "sudo_on",
        "scope": {
            "channel": ctx.message.channel,
            "chat_id": ctx.message.chat_id,
        },
    })
}

pub async fn handle_sudo(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    if !deps.in_system_mode() {
        ctx.reply("⚠️ 当前实例为 user 模式，/sudo 已禁用").await;
        return Ok(());
    }
    if !deps.auth.is_system_admin(&ctx.user_id) {
        ctx.reply("⚠️ 仅 system_admin 可使用 /sudo").await;
        return Ok(());
    }
    if deps.system_client.is_none() {
        ctx.reply("❌ 当前实例未连接 system_service，sudo 不可用（fail-closed）")
            .await;
        return Ok(());
    }

    let parts: Vec<String> = ctx
        .message
        .text
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let status = deps.sudo_status(&ctx.user_id, &ctx.message.channel, &ctx.message.chat_id);

    if parts.len() < 2 {
        ctx.reply(&format!(
            "{}\n\n当前 sudo: <code>{}</code>",
            usage(),
            status_text(&status)
        ))
        .await;
        return Ok(());
    }

    let (normalized, challenge_id) = match extract_challenge(&parts) {
        Ok(pair) => pair,
        Err(e) => {
            ctx.reply(&format!("❌ {e}")).await;
            return Ok(());
        }
    };
    let Some(sub) = normalized.get(1).map(|s| s.to_lowercase()) else {
        ctx.reply(&usage()).await;
        return Ok(());
    };

    match sub.as_str() {
        "status" => {
            ctx.reply(&format!("当前 sudo: <code>{}</code>", status_text(&status)))
                .await;
        }
        "off" => {
            let disabled = deps.disable_sudo(&ctx.message);
            if let Some(manager) = &deps.two_factor {
                manager.clear_pending_approval_input(&ctx.user_id, true);
            }
            if disabled || status.enabled {
                ctx.reply("✅ sudo 已关闭").await;
            } else {
                ctx.reply("ℹ️ sudo 当前已是关闭状态").await;
            }
        }
        "on" => {
            if status.enabled {
                ctx.reply(&format!(
                    "ℹ️ sudo 已开启: <code>{}</code>",
                    status_text(&status)
                ))
                .await;
                return Ok(());
            }
            if !require_sudo_approval(ctx, challenge_id).await {
                return Ok(());
            }
            let deps = ctx.deps.clone();
            let ttl_seconds = deps
                .two_factor
                .as_ref()
                .map(|m| m.approval_grace_seconds.max(1))
                .unwrap_or(600);
            if let Some(manager) = &deps.two_factor {
                manager.activate_approval_window(
                    &ctx.user_id,
                    &ctx.message.channel,
                    &ctx.message.chat_id,
                    Some(ttl_seconds),
                );
            }
            let state = deps.enable_sudo(&ctx.message, ttl_seconds);
            ctx.reply(&format!(
                "✅ sudo 已开启，剩余 <code>{}</code> 秒",
                state.remaining_seconds
            ))
            .await;
        }
        _ => {
            ctx.reply(&usage()).await;
        }
    }
    Ok(())
}

/// Challenge-or-consume: without a challenge id, open one and arm the
/// pending-code window; with one, consume the approved challenge.
async fn require_sudo_approval(ctx: &mut Context, challenge_id: Option<String>) -> bool {
    let deps = ctx.deps.clone();
    let Some(manager) = deps.two_factor.clone() else {
        ctx.reply("❌ two-factor manager 不可用").await;
        return false;
    };
    if !manager.enabled {
        ctx.reply("❌ two_factor.enabled=false，无法开启 sudo").await;
        return false;
    }

    let action = sudo_action_payload(ctx);
    let Some(challenge_id) = challenge_id else {
        let challenge = manager.create_challenge(&ctx.user_id, &action);
        manager.set_pending_approval_input(&ctx.user_id, &challenge.challenge_id, "/sudo on");
        ctx.reply(&format!(
            "🔐 sudo on 需要 2FA 验证\n- challenge_id: <code>{}</code>\n请直接回复 6 位验证码。\n若下一条消息不是验证码，将判定失败并结束本次验证。",
            challenge.challenge_id
        ))
        .await;
        return false;
    };

    let (ok, reason) = manager.consume_approval(&challenge_id, &ctx.user_id, Some(&action));
    if !ok {
        ctx.reply(&format!("❌ 2FA 校验失败: <code>{reason}</code>")).await;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_flag_is_extracted() {
        let parts: Vec<String> = ["/sudo", "on", "--challenge", "abc123"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (normalized, challenge) = extract_challenge(&parts).unwrap();
        assert_eq!(normalized, vec!["/sudo", "on"]);
        assert_eq!(challenge.as_deref(), Some("abc123"));
    }

    #[test]
    fn dangling_challenge_flag_errors() {
        let parts: Vec<String> = ["/sudo", "on", "--challenge"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(extract_challenge(&parts).is_err());
    }
}
