//! Whitelist + rate-limit check.

use async_trait::async_trait;
use kapy_auth::{AuthDecision, DenyReason};
use kapy_core::Result;
use tracing::warn;

use crate::pipeline::{Context, Middleware, Next};

pub struct AuthMiddleware;

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        match ctx.deps.auth.check(&ctx.user_id, &ctx.channel_name) {
            AuthDecision::Allowed => next.run(ctx).await,
            AuthDecision::Denied(DenyReason::RateLimited) => {
                ctx.reply("⚠️ 请求过于频繁，请稍后再试").await;
                Ok(())
            }
            AuthDecision::Denied(reason) => {
                warn!(
                    user_id = %ctx.user_id,
                    channel = %ctx.channel_name,
                    reason = reason.as_str(),
                    "unauthorized access"
                );
                ctx.reply("⚠️ 未授权访问").await;
                Ok(())
            }
        }
    }
}
