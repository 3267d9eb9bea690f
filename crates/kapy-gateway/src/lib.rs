pub mod commands;
pub mod console;
pub mod delivery;
pub mod email_cache;
pub mod middlewares;
pub mod pipeline;
pub mod router;

pub use pipeline::{Context, Middleware, Next, Pipeline};
pub use router::Router;
