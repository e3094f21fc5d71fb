//! Remote access: a bearer-authenticated local HTTP surface plus the
//! supervised cloudflared tunnel that exposes it. The two start and stop as
//! a pair; tokens are persisted hashed (optionally encrypted), never clear.

mod config;
mod ip_limiter;
mod port;
mod server;
mod service;
mod tunnel;

pub use config::TunnelSettings;
pub use ip_limiter::IpRateLimiter;
pub use port::WorkerPort;
pub use server::HttpServerHandle;
pub use server::start_http_server;
pub use service::RemoteAccessService;
pub use tunnel::TunnelRuntime;
pub use tunnel::TunnelState;

/// Default local port the HTTP surface binds to.
pub const DEFAULT_HTTP_PORT: u16 = 8765;

/// Associated-data label binding encrypted token material to its use.
pub const TOKEN_AAD: &str = "tunnel_auth_token";
