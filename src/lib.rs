pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod flow;
pub mod http;
pub mod io;
pub mod proxy;
pub mod server;
pub mod stream;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use filter::Filter;
pub use flow::{Flow, FlowError, FlowState, HTTPFlow, TCPFlow};
pub use http::{Headers, Message, Request, Response};
pub use proxy::{Addon, AddonManager, ProxyServer};
pub use server::MitmproxyServer;
