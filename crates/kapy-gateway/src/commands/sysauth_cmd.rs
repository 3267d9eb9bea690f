//! Out-of-band TOTP enrollment and explicit approval flow: /sysauth.

use kapy_core::Result;
use serde_json::json;

use crate::pipeline::Context;

fn usage() -> String {
    [
        "用法:",
        "• /sysauth plan &lt;action text&gt;",
        "• /sysauth approve &lt;challenge_id&gt; &lt;totp_code&gt;",
        "• /sysauth status &lt;challenge_id&gt;",
        "• /sysauth setup start",
        "• /sysauth setup verify &lt;totp_code&gt;",
        "• /sysauth setup status",
        "• /sysauth setup cancel",
    ]
    .join("\n")
}

fn setup_usage() -> String {
    [
        "用法:",
        "• /sysauth setup start",
        "• /sysauth setup verify &lt;totp_code&gt;",
        "• /sysauth setup status",
        "• /sysauth setup cancel",
    ]
    .join("\n")
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub async fn handle_sysauth(ctx: &mut Context) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(manager) = deps.two_factor.clone() else {
        ctx.reply("❌ Two-factor manager not available").await;
        return Ok(());
    };
    if !manager.enabled {
        ctx.reply("❌ two_factor.enabled=false，/sysauth 已禁用").await;
        return Ok(());
    }

    let text = ctx.message.text.trim().to_string();
    let parts: Vec<String> = text.split_whitespace().map(|s| s.to_string()).collect();
    let Some(sub) = parts.get(1).map(|s| s.to_lowercase()) else {
        ctx.reply(&usage()).await;
        return Ok(());
    };

    match sub.as_str() {
        "setup" => handle_setup(ctx, &manager, &parts).await,
        "plan" => {
            // Everything after "plan" is the action text.
            let action_text = text
                .splitn(3, char::is_whitespace)
                .nth(2)
                .unwrap_or("")
                .trim()
                .to_string();
            if action_text.is_empty() {
                ctx.reply("用法: /sysauth plan &lt;action text&gt;").await;
                return Ok(());
            }
            let payload = json!({
                "action": action_text,
                "channel": ctx.message.channel,
                "chat_id": ctx.message.chat_id,
                "user_id": ctx.user_id,
            });
            let challenge = manager.create_challenge(&ctx.user_id, &payload);
            let ttl = (challenge.expires_at - challenge.created_at) as u64;
            let hash_preview: String = challenge.action_hash.chars().take(16).collect();
            ctx.reply(&format!(
                "✅ 已创建 2FA 审批请求\n- challenge_id: <code>{}</code>\n- ttl_seconds: <code>{ttl}</code>\n- action_hash: <code>{hash_preview}...</code>\n下一步: /sysauth approve &lt;challenge_id&gt; &lt;totp_code&gt;",
                challenge.challenge_id
            ))
            .await;
            Ok(())
        }
        "approve" => {
            let (Some(challenge_id), Some(code)) = (parts.get(2), parts.get(3)) else {
                ctx.reply("用法: /sysauth approve &lt;challenge_id&gt; &lt;totp_code&gt;")
                    .await;
                return Ok(());
            };
            let (ok, reason) = manager.approve_challenge(challenge_id, &ctx.user_id, code, None);
            if !ok {
                ctx.reply(&format!("❌ 2FA 审批失败: <code>{reason}</code>")).await;
                return Ok(());
            }
            let window = manager.activate_approval_window(
                &ctx.user_id,
                &ctx.message.channel,
                &ctx.message.chat_id,
                None,
            );
            ctx.reply(&format!(
                "✅ 2FA 审批通过，本聊天 <code>{}</code> 秒内免挑战",
                window.ttl_seconds
            ))
            .await;
            Ok(())
        }
        "status" => {
            let Some(challenge_id) = parts.get(2) else {
                ctx.reply("用法: /sysauth status &lt;challenge_id&gt;").await;
                return Ok(());
            };
            let st = manager.status(challenge_id, &ctx.user_id);
            if !st.exists {
                ctx.reply("❌ challenge 不存在或不属于你").await;
                return Ok(());
            }
            let expires_in = st
                .expires_at
                .map(|e| (e - now_secs()) as i64)
                .unwrap_or(0);
            ctx.reply(&format!(
                "ℹ️ 2FA challenge 状态\n- challenge_id: <code>{}</code>\n- approved: <code>{}</code>\n- expires_in: <code>{expires_in}</code>",
                st.challenge_id.unwrap_or_default(),
                st.approved
            ))
            .await;
            Ok(())
        }
        _ => {
            ctx.reply(&usage()).await;
            Ok(())
        }
    }
}

async fn handle_setup(
    ctx: &mut Context,
    manager: &std::sync::Arc<kapy_privileged::TwoFactorManager>,
    parts: &[String],
) -> Result<()> {
    let deps = ctx.deps.clone();
    let Some(action) = parts.get(2).map(|s| s.to_lowercase()) else {
        ctx.reply(&setup_usage()).await;
        return Ok(());
    };

    match action.as_str() {
        "start" => {
            let issuer = manager.issuer.clone();
            let account_name = format!("{}:{}", deps.config.runtime.instance_id, ctx.user_id);
            let ticket = manager.begin_enrollment(&ctx.user_id, &account_name, &issuer);
            let expires_in = (ticket.expires_at - now_secs()).max(0.0) as u64;

            let mut lines = vec![
                "🔐 已创建 2FA 绑定会话".to_string(),
                format!("- issuer: <code>{}</code>", ticket.issuer),
                format!("- account: <code>{}</code>", ticket.account_name),
                format!("- expires_in: <code>{expires_in}</code>"),
                format!("- reused: <code>{}</code>", ticket.reused),
                format!("- secret: <code>{}</code>", ticket.secret),
                "下一步: /sysauth setup verify &lt;totp_code&gt;".to_string(),
            ];
            if ticket.already_configured {
                lines.push("⚠️ 当前用户已有旧绑定，本次 verify 成功后会覆盖旧 secret。".to_string());
            }
            lines.push(format!("- otpauth: <code>{}</code>", ticket.otpauth_uri));
            ctx.reply(&lines.join("\n")).await;
            Ok(())
        }
        "verify" => {
            let Some(code) = parts.get(3) else {
                ctx.reply("用法: /sysauth setup verify &lt;totp_code&gt;").await;
                return Ok(());
            };
            let (ok, reason) = manager.verify_enrollment(&ctx.user_id, code);
            if !ok {
                ctx.reply(&format!("❌ 2FA 绑定失败: <code>{reason}</code>")).await;
                return Ok(());
            }
            ctx.reply("✅ 2FA 绑定成功并已保存。后续可使用 /sysauth approve 与 /sudo 系统命令。")
                .await;
            Ok(())
        }
        "status" => {
            let st = manager.enrollment_status(&ctx.user_id);
            let expires_in = st
                .pending_expires_at
                .map(|e| (e - now_secs()).max(0.0) as u64)
                .unwrap_or(0);
            ctx.reply(&format!(
                "ℹ️ 2FA 绑定状态\n- configured: <code>{}</code>\n- pending: <code>{}</code>\n- pending_expires_in: <code>{expires_in}</code>",
                st.configured, st.pending
            ))
            .await;
            Ok(())
        }
        "cancel" => {
            if manager.cancel_enrollment(&ctx.user_id) {
                ctx.reply("✅ 已取消当前 2FA 绑定会话。").await;
            } else {
                ctx.reply("ℹ️ 当前没有待确认的绑定会话。").await;
            }
            Ok(())
        }
        _ => {
            ctx.reply(&setup_usage()).await;
            Ok(())
        }
    }
}
