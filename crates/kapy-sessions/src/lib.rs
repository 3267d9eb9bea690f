pub mod id;
pub mod scope;
pub mod store;
pub mod types;

pub use scope::{build_scope_id, build_scope_workspace_dir};
pub use store::SessionStore;
pub use types::{HistoryEntry, ManagedSession};
