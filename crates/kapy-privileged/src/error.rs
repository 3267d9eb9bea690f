use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegedError {
    #[error("grant secret is required")]
    MissingSecret,

    #[error("daemon bind failed: {0}")]
    Bind(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PrivilegedError>;
