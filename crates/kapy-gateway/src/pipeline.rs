//! Middleware pipeline with a shared per-request context.
//!
//! Middlewares form an onion: each receives the context and a `Next`
//! handle and decides whether to continue the chain or short-circuit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kapy_agent::AgentAdapter;
use kapy_channels::{Channel, IncomingMessage};
use kapy_core::Result;
use kapy_sessions::ManagedSession;

use crate::router::Deps;

/// Per-request context flowing through the middleware chain.
pub struct Context {
    /// The (possibly rewritten) incoming message.
    pub message: IncomingMessage,
    pub channel_name: String,
    pub user_id: String,
    /// Shared components, injected by the router.
    pub deps: Arc<Deps>,

    // Mutable working state, set by middlewares.
    pub session: Option<ManagedSession>,
    pub agent: Option<Arc<dyn AgentAdapter>>,
    pub response: String,
}

impl Context {
    pub fn new(message: IncomingMessage, deps: Arc<Deps>) -> Self {
        Self {
            channel_name: message.channel.clone(),
            user_id: message.user_id.clone(),
            message,
            deps,
            session: None,
            agent: None,
            response: String::new(),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.deps.channel
    }

    pub fn agents(&self) -> &HashMap<String, Arc<dyn AgentAdapter>> {
        &self.deps.agents
    }

    /// Send a formatted reply to the originating chat, converting the
    /// lightweight HTML markup for non-Telegram channels.
    pub async fn reply(&self, text: &str) {
        let formatted = crate::router::fmt_for_channel(&self.channel_name, text);
        if let Err(e) = self
            .deps
            .channel
            .send_text(&self.message.chat_id, &formatted)
            .await
        {
            tracing::warn!(error = %e, chat_id = %self.message.chat_id, "reply send failed");
        }
    }
}

/// One stage of the pipeline. Call `next.run(ctx)` to continue, or return
/// without doing so to short-circuit.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<()>;
}

/// Handle to the remainder of the chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut Context) -> Result<()> {
        match self.rest.split_first() {
            Some((first, rest)) => first.handle(ctx, Next { rest }).await,
            None => Ok(()),
        }
    }
}

/// Ordered middleware chain.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn execute(&self, ctx: &mut Context) -> Result<()> {
        Next {
            rest: &self.middlewares,
        }
        .run(ctx)
        .await
    }
}
