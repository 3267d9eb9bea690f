pub mod config;
pub mod error;
pub mod formatter;
pub mod rules;
pub mod runtime;

pub use error::{GatewayError, Result};

/// Maximum attachment size accepted by the prompt builder (10 MiB).
pub const MAX_ATTACHMENT_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Interval between streaming `edit_message` updates.
pub const STREAM_UPDATE_INTERVAL_SECS: f64 = 2.0;

/// Maximum prompt/response pairs kept per session.
pub const MAX_HISTORY_ENTRIES: usize = 20;

/// Idle seconds without a new chunk before a stream is considered stalled.
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 300;
