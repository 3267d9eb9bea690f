use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Send failed ({channel}): {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("Edit failed ({channel}): {reason}")]
    EditFailed { channel: String, reason: String },

    #[error("Channel not connected: {0}")]
    NotConnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
