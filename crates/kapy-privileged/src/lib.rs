pub mod audit;
pub mod client;
pub mod error;
pub mod executor;
pub mod grant;
pub mod sandbox;
pub mod server;
pub mod sudo;
pub mod totp;
pub mod two_factor;

pub use client::SystemServiceClient;
pub use error::PrivilegedError;
pub use executor::SystemExecutor;
pub use grant::{canonical_action, action_hash, GrantClaims, SystemGrantManager};
pub use server::SystemServiceServer;
pub use sudo::SudoStateManager;
pub use two_factor::TwoFactorManager;
