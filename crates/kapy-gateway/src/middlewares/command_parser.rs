//! Gateway-command dispatch via the explicit registry.

use async_trait::async_trait;
use kapy_core::Result;
use tracing::info;

use crate::commands::CommandRegistry;
use crate::pipeline::{Context, Middleware, Next};

pub struct CommandParser {
    registry: CommandRegistry,
}

impl CommandParser {
    pub fn standard() -> Self {
        Self {
            registry: CommandRegistry::standard(),
        }
    }
}

#[async_trait]
impl Middleware for CommandParser {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()> {
        let mut text = ctx.message.text.trim().to_string();

        // `kapy <subcommand>` shorthand: rewrite the message itself so
        // downstream handlers see the canonical slash form.
        if let Some(prefix) = text.get(..5) {
            if prefix.eq_ignore_ascii_case("kapy ") {
                let sub = text[5..].trim().to_string();
                if sub.is_empty() {
                    ctx.reply("用法: kapy &lt;command&gt; [args]\n发送 'kapy help' 查看帮助")
                        .await;
                    return Ok(());
                }
                text = format!("/{sub}");
                ctx.message = ctx.message.with_text(text.clone());
            }
        }

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

        match self.registry.get(&cmd_name) {
            Some(spec) => crate::commands::dispatch(spec.kind, ctx).await,
            None => {
                // Not a gateway command; forward to the agent.
                info!(command = %cmd_name, "forwarding unregistered command to agent");
                next.run(ctx).await
            }
        }
    }
}
