pub mod adapter;
pub mod claude;
pub mod error;
pub mod registry;
pub mod runner;
pub mod streaming;
pub mod types;
pub mod workspace;

pub use adapter::{AgentAdapter, ChunkStream};
pub use claude::ClaudeCodeAgent;
pub use error::AgentError;
pub use streaming::StreamingCliAgent;
pub use types::{HealthReport, SendOptions, SessionInfo, UsageInfo};
