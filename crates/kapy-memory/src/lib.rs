pub mod classify;
pub mod db;
pub mod embed;
pub mod error;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use store::MemoryStore;
pub use types::{MemoryRecord, RetrievalEvent, RetrievalStats};

/// Owner id for records visible to every user of this gateway instance.
pub const SYSTEM_OWNER: &str = "__system__";
