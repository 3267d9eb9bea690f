use serde::{Deserialize, Serialize};

/// A file attached to an incoming message, already staged on local disk
/// by the channel binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    /// Local staging path the gateway may copy from.
    pub filepath: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// A normalized message received from a chat channel.
///
/// Channel bindings (Telegram, Discord, email) construct this record and
/// hand it to the router's message handler; the pipeline never sees
/// platform-native payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Logical channel name (e.g. "telegram", "discord", "email").
    pub channel: String,
    /// Platform-native chat identifier replies go back to.
    pub chat_id: String,
    /// Platform-native sender identifier.
    pub user_id: String,
    /// Plain text content.
    #[serde(default)]
    pub text: String,
    /// True for direct messages (affects the session scope).
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_reply_to_bot: bool,
    #[serde(default)]
    pub is_mention_bot: bool,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub sender_display_name: Option<String>,
    /// Platform mention token for the sender (e.g. `<@1234>`).
    #[serde(default)]
    pub sender_mention: Option<String>,
    /// Session id hint; only the email channel sets this to pin a reply
    /// to the session that produced the original message.
    #[serde(default)]
    pub session_hint: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl IncomingMessage {
    /// Minimal constructor for tests and internal requeues.
    pub fn text_message(channel: &str, chat_id: &str, user_id: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            is_private: true,
            is_reply_to_bot: false,
            is_mention_bot: false,
            sender_username: None,
            sender_display_name: None,
            sender_mention: None,
            session_hint: None,
            attachments: Vec::new(),
        }
    }

    /// Copy of this message with different text (used by the command
    /// parser's `kapy <sub>` rewrite and the 2FA retry substitution).
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.text = text.into();
        out
    }
}
