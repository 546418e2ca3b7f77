/// Path of Building gateway
///
/// Resolves Path of Exile account handles to character listings and build
/// documents through a cascade of upstream sources, behind a per-client rate
/// limiter and a short-lived result cache.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod rate_limit;
pub mod resolver;
pub mod server;
pub mod upstream;

pub use context::AppContext;
pub use error::{GatewayError, GatewayResult, ResolveError};
