use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Agent not found: {name}")]
    AgentNotFound { name: String },

    #[error("Channel error ({channel}): {reason}")]
    Channel { channel: String, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {secs}s")]
    Timeout { secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short stable code for audit lines and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            GatewayError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            GatewayError::Channel { .. } => "CHANNEL_ERROR",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
