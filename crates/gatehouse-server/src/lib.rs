pub mod config;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod server;
pub mod session;

pub use config::{AppConfig, LoggingConfig, ServerConfig, SessionConfig, UpstreamConfig};
pub use observability::{init_tracing, shutdown_tracing};
pub use proxy::{ProxyError, UpstreamProxy};
pub use server::{AppState, GatehouseServer, ServerBuilder, build_app};
pub use session::{SessionHandle, SessionStore};
