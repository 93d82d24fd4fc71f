//! HTTP surface over the artifact store and the dispatcher.

pub mod api;
pub mod server;

pub use api::{ApiError, AppState, SharedState, api_router};
pub use server::{ServerConfig, build_router, start_server};
