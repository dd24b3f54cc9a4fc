//! HTTP API module.
//!
//! Login and token refresh endpoints plus the location stream upgrade.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, Message};
pub use routes::create_router;
pub use state::AppState;
