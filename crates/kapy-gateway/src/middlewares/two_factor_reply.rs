//! Interactive 2FA reply handling.
//!
//! When a privileged command armed a pending code-input window, the next
//! message from that user must be a 6-digit TOTP code. A matching code
//! substitutes the stored retry command back into the message; anything
//! else clears the pending state and revokes the challenge.

use async_trait::async_trait;
use kapy_core::Result;

use crate::pipeline::{Context, Middleware, Next};

fn is_totp_code(text: &str) -> bool {
    text.len() == 6 && text.bytes().all(|b| b.is_ascii_digit())
}

pub struct TwoFactorReply;

#[async_trait]
impl Middleware for TwoFactorReply {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        let Some(manager) = ctx.deps.two_factor.clone() else {
            return next.run(ctx).await;
        };
        if !manager.enabled || !ctx.deps.in_system_mode() {
            return next.run(ctx).await;
        }
        if manager.get_pending_approval_input(&ctx.user_id).is_none() {
            return next.run(ctx).await;
        }

        let text = ctx.message.text.trim().to_string();
        if !is_totp_code(&text) {
            manager.clear_pending_approval_input(&ctx.user_id, true);
            ctx.reply("❌ 2FA 验证失败：本次只接受 6 位验证码输入。验证已结束，请重新发起系统操作。")
                .await;
            return Ok(());
        }

        let (ok, reason, approved) = manager.approve_pending_input_code(&ctx.user_id, &text);
        let Some(pending) = approved.filter(|_| ok) else {
            ctx.reply(&format!("❌ 2FA 验证失败: <code>{reason}</code>")).await;
            return Ok(());
        };

        manager.activate_approval_window(
            &ctx.user_id,
            &ctx.message.channel,
            &ctx.message.chat_id,
            None,
        );

        let mut retry_cmd = pending.retry_cmd.trim().to_string();
        if retry_cmd.is_empty() {
            ctx.reply("❌ 2FA 验证失败: <code>retry_command_missing</code>").await;
            return Ok(());
        }
        if !retry_cmd.contains("--challenge") && !pending.challenge_id.is_empty() {
            retry_cmd = format!("{retry_cmd} --challenge {}", pending.challenge_id);
        }

        // Replay the original command with the approved challenge attached.
        ctx.message = ctx.message.with_text(retry_cmd);
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_code_shape() {
        assert!(is_totp_code("123456"));
        assert!(!is_totp_code("12345"));
        assert!(!is_totp_code("1234567"));
        assert!(!is_totp_code("12345a"));
        assert!(!is_totp_code(""));
    }
}
