//! Scope-id and workspace-directory derivation.

use std::sync::OnceLock;

use kapy_channels::IncomingMessage;
use regex::Regex;

fn unsafe_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap())
}

fn safe_segment(value: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return "unknown".to_string();
    }
    unsafe_segment_re().replace_all(text, "_").into_owned()
}

/// Stable scope key for active-session routing: DMs key on the user,
/// group chats key on the chat.
pub fn build_scope_id(message: &IncomingMessage) -> String {
    let channel = {
        let c = message.channel.trim().to_lowercase();
        if c.is_empty() {
            "unknown".to_string()
        } else {
            c
        }
    };
    if message.is_private {
        format!("{channel}:dm:{}", message.user_id)
    } else {
        format!("{channel}:chat:{}", message.chat_id)
    }
}

/// Per-scope workspace subdirectory name (filesystem-safe).
pub fn build_scope_workspace_dir(message: &IncomingMessage) -> String {
    let channel = safe_segment(&message.channel.trim().to_lowercase());
    if message.is_private {
        format!("{channel}_user_{}", safe_segment(&message.user_id))
    } else {
        format!("{channel}_{}", safe_segment(&message.chat_id))
    }
}
