//! The proxy core: accept loop, protocol layers, hooks and interception.
//!
//! [`server::handle_client`] peeks at a new connection and hands it to the
//! matching layer. Layers read messages from the client, run them through the
//! addon hooks and the [`Interceptor`], carry them upstream and write the
//! response back.

pub mod context;
pub mod hooks;
pub mod intercept;
pub mod layers;
pub mod server;
pub mod upstream;

pub use context::{Context, ContextOptions};
pub use hooks::{Addon, AddonManager, RequestOptions};
pub use intercept::{Interceptor, PendingFlow};
pub use server::{handle_client, ProxyServer};
pub use upstream::{ServerConnector, TcpConnector};
