//! HTTP surface: rate limiting middleware and a small server around it

pub mod middleware;
mod router;
mod server;

pub use middleware::{AuthenticatedUser, RateLimitState, rate_limit_middleware};
pub use router::{AppState, create_router};
pub use server::Gateway;
