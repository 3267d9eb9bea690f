//! Final stage: acquire the session lock, build the prompt, invoke the
//! agent, and stream the response back to the channel.

use async_trait::async_trait;
use kapy_agent::{AgentAdapter, SendOptions};
use kapy_channels::Channel;
use kapy_core::{Result, MAX_HISTORY_ENTRIES};
use tracing::{error, warn};

use crate::delivery::StreamingDelivery;
use crate::pipeline::{Context, Middleware, Next};

pub struct AgentDispatcher;

#[async_trait]
impl Middleware for AgentDispatcher {
    async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> Result<()> {
        let deps = ctx.deps.clone();
        let Some(session) = ctx.session.clone() else {
            return Ok(());
        };
        let Some(agent) = ctx.agent.clone() else {
            return Ok(());
        };
        let session_id = session.session_id.clone();

        // One outstanding turn per session, fail fast.
        let lock = deps.session_lock(&session_id);
        let Ok(_guard) = lock.try_lock() else {
            ctx.reply("⏳ 上一个请求还在处理中，请稍后再试").await;
            return Ok(());
        };

        // Orphan-busy cleanup: busy flag set but the child is gone.
        if let Some(info) = agent.get_session_info(&session_id) {
            if info.is_busy && !agent.is_process_alive(&session_id) {
                warn!(session_id = %session_id, "session marked busy but process is dead, cleaning up");
                agent.kill_process(&session_id).await;
            }
        }

        let prompt = deps
            .prepare_prompt(&mut ctx.message, &agent, &session)
            .await;
        let _ = deps.channel.send_typing(&ctx.message.chat_id).await;

        if ctx.message.channel == "email" {
            deps.set_reply_session(&ctx.message.chat_id, &session_id);
        }

        deps.sessions.add_history(
            &session_id,
            "user",
            &ctx.message.text,
            MAX_HISTORY_ENTRIES,
            false,
        );

        let run_as_root = deps.is_sudo_enabled(&ctx.message);
        let cancel = deps.new_cancel_token(&session_id);
        let options = SendOptions {
            model: session.model.clone(),
            params: session.params.clone(),
            run_as_root,
        };

        let response = match agent.send_message(&session_id, &prompt, options).await {
            Ok(chunks) => {
                let delivery = StreamingDelivery::new(&deps.formatter);
                delivery
                    .deliver(&deps.channel, &ctx.message.chat_id, chunks, cancel)
                    .await
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "agent invocation failed");
                let response = "❌ 处理请求时出错，请稍后重试".to_string();
                ctx.reply(&response).await;
                response
            }
        };
        ctx.response = response.clone();

        deps.sessions.add_history(
            &session_id,
            "assistant",
            &response,
            MAX_HISTORY_ENTRIES,
            false,
        );
        deps.sessions.touch(&session_id);

        if let Some(memory) = &deps.memory {
            if memory.enabled {
                let scope_id = deps.scope_id(&ctx.message);
                let captured = memory
                    .capture_turn(
                        &ctx.user_id,
                        &scope_id,
                        &session_id,
                        &ctx.message.channel,
                        &ctx.message.text,
                        &response,
                    )
                    .await;
                if captured.is_none() {
                    tracing::debug!(session_id = %session_id, "turn not captured");
                }
            }
        }

        deps.record_usage(&ctx.message, &agent, &session);
        Ok(())
    }
}
