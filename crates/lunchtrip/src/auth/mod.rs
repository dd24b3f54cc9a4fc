//! Authentication module.
//!
//! Provides JWT issuing and validation for configured users, plus the
//! middleware that guards the location stream.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError, UserAccount};
pub use error::AuthError;
pub use middleware::{
    AUTH_COOKIE, AuthState, CurrentUser, IssuedToken, auth_middleware, request_token,
};
