//! Minimal in-process channel for local operation and smoke testing.
//!
//! Reads lines from stdin as messages from a single local user and
//! prints outbound messages to stdout. Real deployments plug platform
//! bindings in through the same `Channel` trait.

use async_trait::async_trait;
use kapy_channels::channel::Channel;
use kapy_channels::error::Result;

pub const CONSOLE_CHANNEL: &str = "console";
pub const CONSOLE_USER: &str = "local";
pub const CONSOLE_CHAT: &str = "console";

pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        CONSOLE_CHANNEL
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> Result<Option<String>> {
        println!("{text}");
        Ok(None)
    }

    async fn send_file(&self, _chat_id: &str, path: &str, caption: &str) -> Result<()> {
        println!("[file] {caption}: {path}");
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &str) -> Result<()> {
        Ok(())
    }

    async fn edit_message(&self, _chat_id: &str, _message_id: &str, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }
}
