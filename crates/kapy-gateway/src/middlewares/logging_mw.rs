//! Request arrival + processing-time logging.

use async_trait::async_trait;
use kapy_core::Result;
use tracing::info;

use crate::pipeline::{Context, Middleware, Next};

pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        let preview: String = ctx.message.text.chars().take(60).collect();
        info!(
            user_id = %ctx.user_id,
            channel = %ctx.channel_name,
            preview = %preview,
            "message received"
        );
        let start = std::time::Instant::now();
        let result = next.run(ctx).await;
        info!(
            user_id = %ctx.user_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            response_len = ctx.response.len(),
            "message processed"
        );
        result
    }
}
