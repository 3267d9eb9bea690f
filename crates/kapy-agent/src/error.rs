use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
