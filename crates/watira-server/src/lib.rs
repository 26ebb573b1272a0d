pub mod error;
pub mod handlers;
pub mod runs;
pub mod server;

pub use error::ApiError;
pub use runs::{ActiveRuns, RunGuard};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
