use async_trait::async_trait;

use crate::error::Result;

/// Common interface implemented by every channel binding (Telegram,
/// Discord, email, …).
///
/// Implementations must be `Send + Sync` so a single binding can be driven
/// from many concurrent tasks. All methods take `&self`; a connected
/// binding is expected to multiplex sends internally.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Whether the platform supports editing a sent message in place.
    /// Streaming delivery falls back to batch mode when false.
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Send a text message, returning the platform message id when the
    /// platform exposes one (needed for streaming edits).
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<Option<String>>;

    /// Send a local file with an optional caption.
    async fn send_file(&self, chat_id: &str, path: &str, caption: &str) -> Result<()>;

    /// Best-effort typing indicator; bindings may no-op.
    async fn send_typing(&self, chat_id: &str) -> Result<()>;

    /// Replace the text of a previously sent message.
    async fn edit_message(&self, chat_id: &str, message_id: &str, text: &str) -> Result<()>;
}
