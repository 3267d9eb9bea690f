//! Runtime-mode gate for system-level command routing.
//!
//! `/sys` is retired outright; the remaining system commands are only
//! reachable in system mode and only by system admins.

use async_trait::async_trait;
use kapy_core::Result;

use crate::middlewares::normalize_text;
use crate::pipeline::{Context, Middleware, Next};

const SYSTEM_COMMAND_PREFIXES: &[&str] = &[
    "/sysauth", "/sys", "/sudo", "/system", "/docker", "/cron", "/journal", "/config",
];

fn is_system_command(cmd_name: &str) -> bool {
    SYSTEM_COMMAND_PREFIXES
        .iter()
        .any(|prefix| cmd_name == *prefix || cmd_name.starts_with(&format!("{prefix}.")))
}

pub struct ModeGuard;

#[async_trait]
impl Middleware for ModeGuard {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        let text = normalize_text(&ctx.message.text);
        if !text.starts_with('/') {
            return next.run(ctx).await;
        }

        let cmd_name = text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();
        if !is_system_command(&cmd_name) {
            return next.run(ctx).await;
        }

        if cmd_name == "/sys" || cmd_name.starts_with("/sys.") {
            ctx.reply("⚠️ /sys 指令已下线，请使用 `/sudo on` 开启 2FA 授权后直接下发自然语言任务")
                .await;
            return Ok(());
        }

        if !ctx.deps.in_system_mode() {
            ctx.reply("⚠️ 当前实例为 user 模式，系统级命令已禁用").await;
            return Ok(());
        }

        if !ctx.deps.auth.is_system_admin(&ctx.user_id) {
            ctx.reply("⚠️ 仅 system_admin 可执行系统级命令").await;
            return Ok(());
        }

        next.run(ctx).await
    }
}
