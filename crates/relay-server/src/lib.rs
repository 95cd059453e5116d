//! # relay-server
//!
//! Connection boundary, configuration and metrics around the relay hub.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Authorizer, TokenAuthorizer};
pub use config::Config;
pub use handlers::{app, run_server, AppState};
