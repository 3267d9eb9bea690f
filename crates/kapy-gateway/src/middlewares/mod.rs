//! Pipeline stages, in their fixed order.

mod agent_dispatcher;
mod auth_mw;
mod command_parser;
mod logging_mw;
mod mode_guard;
mod session_resolver;
mod two_factor_reply;

use std::sync::Arc;

pub use agent_dispatcher::AgentDispatcher;
pub use auth_mw::AuthMiddleware;
pub use command_parser::CommandParser;
pub use logging_mw::LoggingMiddleware;
pub use mode_guard::ModeGuard;
pub use session_resolver::SessionResolver;
pub use two_factor_reply::TwoFactorReply;

use crate::pipeline::{Middleware, Pipeline};

/// The standard chain:
/// logging → auth → mode-guard → two-factor-reply → command-parser →
/// session-resolver → agent-dispatcher.
pub fn build_pipeline() -> Pipeline {
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(LoggingMiddleware),
        Arc::new(AuthMiddleware),
        Arc::new(ModeGuard),
        Arc::new(TwoFactorReply),
        Arc::new(CommandParser::standard()),
        Arc::new(SessionResolver),
        Arc::new(AgentDispatcher),
    ];
    Pipeline::new(middlewares)
}

/// Normalize the `kapy <sub>` shorthand into the `/<sub>` form without
/// mutating the message (classification only).
pub(crate) fn normalize_text(raw: &str) -> String {
    let text = raw.trim();
    if let Some(prefix) = text.get(..5) {
        if prefix.eq_ignore_ascii_case("kapy ") {
            let sub = text[5..].trim();
            if !sub.is_empty() {
                return format!("/{sub}");
            }
        }
    }
    text.to_string()
}
