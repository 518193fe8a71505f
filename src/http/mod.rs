//! HTTP surface: the enforcement gate and the routes it protects.

mod auth;
mod middleware;
mod routes;

pub use auth::{bearer_token, Authenticator, Principal, StaticTokenAuthenticator};
pub use middleware::{
    Gate, GateOptions, HandlerFault, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
};
pub use routes::router;
