use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;
use crate::types::{HealthReport, SendOptions, SessionInfo, UsageInfo};

/// Lazy sequence of user-visible output chunks from one agent turn.
pub type ChunkStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Contract every agent adapter exposes, regardless of binary shape.
///
/// Implementations must be `Send + Sync`; the router drives one adapter
/// from many sessions concurrently and serializes per-session access
/// itself — the adapter only guarantees one in-flight child per session.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Gateway-visible agent name (config key).
    fn name(&self) -> &str;

    /// Create (or return) a session and initialize its workspace tree.
    /// Idempotent: an existing id is returned with `last_active` touched.
    async fn create_session(
        &self,
        user_id: &str,
        chat_id: &str,
        session_id: Option<&str>,
    ) -> Result<SessionInfo>;

    fn get_session_info(&self, session_id: &str) -> Option<SessionInfo>;

    /// Invoke the binary and stream its output. Sets `is_busy` for the
    /// stream's lifetime; chunks arrive in order, exactly once.
    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        opts: SendOptions,
    ) -> Result<ChunkStream>;

    /// Terminate the in-flight child, if any, and clear `is_busy`.
    async fn cancel(&self, session_id: &str) -> Result<()>;

    /// Cancel first, then drop in-memory state. The workspace directory
    /// is retained on disk.
    async fn destroy_session(&self, session_id: &str) -> Result<()>;

    fn health_check(&self, session_id: &str) -> HealthReport;

    /// Pop the usage record of the last completed turn.
    fn get_last_usage(&self, session_id: &str) -> Option<UsageInfo>;

    /// Whether the session's recorded child process is still running.
    fn is_process_alive(&self, session_id: &str) -> bool;

    /// Kill whatever child is left and clear the busy flag (orphan-busy
    /// recovery path).
    async fn kill_process(&self, session_id: &str);
}
