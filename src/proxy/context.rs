//! State every protocol layer of one client connection works with.

use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Config, ProxyMode};
use crate::connection::{Address, ConnectionRegistry, ConnectionState, Server};
use crate::filter::Filter;
use crate::http::http1::ReadOptions;
use crate::http::Request;
use crate::io::SaveStream;
use crate::proxy::hooks::{AddonManager, RequestOptions};
use crate::proxy::intercept::{Interceptor, PendingFlow};
use crate::proxy::upstream::{BoxedStream, ServerConnector, TcpConnector};
use crate::utils::now;
use crate::{Error, Result};

/// Protocol options derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub mode: ProxyMode,
    /// Fixed server in reverse mode.
    pub reverse_target: Option<Address>,
    pub read_options: ReadOptions,
    pub http2: bool,
    pub upstream_http2: bool,
    pub rawtcp: bool,
    pub max_tcp_messages: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Regular,
            reverse_target: None,
            read_options: ReadOptions::default(),
            http2: true,
            upstream_http2: true,
            rawtcp: true,
            max_tcp_messages: 1000,
        }
    }
}

impl ContextOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let reverse_target = match config.mode {
            ProxyMode::Reverse => Some(config.reverse_address()?),
            ProxyMode::Regular => None,
        };
        Ok(Self {
            mode: config.mode,
            reverse_target,
            read_options: ReadOptions {
                body_size_limit: config.body_size_limit,
                reject_ambiguous_framing: config.reject_ambiguous_framing,
            },
            http2: config.http2,
            upstream_http2: config.upstream_http2,
            rawtcp: config.rawtcp,
            max_tcp_messages: config.max_tcp_messages,
        })
    }
}

#[derive(Clone)]
pub struct Context {
    /// Registry id of the client connection; empty for the server-wide template.
    pub client_id: String,
    pub options: Arc<ContextOptions>,
    pub registry: Arc<ConnectionRegistry>,
    pub addons: Arc<AddonManager>,
    pub interceptor: Interceptor,
    pub connector: Arc<dyn ServerConnector>,
    /// Server named by the CONNECT request this connection is tunnelled through.
    pub tunnel_target: Option<Address>,
    servers: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("client_id", &self.client_id)
            .field("options", &self.options)
            .field("addons", &self.addons)
            .field("intercept", &self.interceptor.is_enabled())
            .finish()
    }
}

impl Context {
    pub fn new(
        options: ContextOptions,
        registry: Arc<ConnectionRegistry>,
        addons: AddonManager,
        interceptor: Interceptor,
        connector: Arc<dyn ServerConnector>,
    ) -> Self {
        Self {
            client_id: String::new(),
            options: Arc::new(options),
            registry,
            addons: Arc::new(addons),
            interceptor,
            connector,
            tunnel_target: None,
            servers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build the template context from configuration.
    ///
    /// Also returns the receiving end of the intercept queue when an intercept
    /// filter is configured.
    pub fn from_config(
        config: &Config,
        mut addons: AddonManager,
    ) -> Result<(Self, Option<tokio::sync::mpsc::Receiver<PendingFlow>>)> {
        let options = ContextOptions::from_config(config)?;
        let registry = Arc::new(ConnectionRegistry::new());
        if let Some(path) = &config.save_stream_file {
            let path = config.expand_path(path);
            addons.add(SaveStream::create(&path, registry.clone())?);
            info!(%path, "saving flows");
        }
        if config.anticache || config.anticomp {
            addons.add(RequestOptions {
                anticache: config.anticache,
                anticomp: config.anticomp,
            });
        }
        let (interceptor, rx) = match &config.intercept {
            Some(expression) => {
                let (interceptor, rx) =
                    Interceptor::new(Filter::new(expression)?, config.intercept_timeout());
                (interceptor, Some(rx))
            }
            None => (Interceptor::disabled(), None),
        };
        let context = Self::new(
            options,
            registry,
            addons,
            interceptor,
            Arc::new(TcpConnector::new(config.connect_timeout())),
        );
        Ok((context, rx))
    }

    /// Context for a newly accepted client connection.
    pub fn for_client(&self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            tunnel_target: None,
            servers: Arc::new(Mutex::new(Vec::new())),
            ..self.clone()
        }
    }

    /// Same connection, now carrying tunnelled traffic for `address`.
    pub fn with_tunnel_target(&self, address: Address) -> Self {
        Self {
            tunnel_target: Some(address),
            ..self.clone()
        }
    }

    pub fn read_options(&self) -> &ReadOptions {
        &self.options.read_options
    }

    /// Where a request has to go: the tunnel or reverse target, or the
    /// request's own host.
    pub fn upstream_address(&self, request: &Request) -> Result<Address> {
        if let Some(target) = self.tunnel_target.as_ref().or(self.options.reverse_target.as_ref()) {
            return Ok(target.clone());
        }
        match &request.host {
            Some(host) => Ok((host.clone(), request.port_or_default())),
            None => Err(Error::bad_preamble(
                "relative request target in regular proxy mode",
            )),
        }
    }

    /// Open and register a server connection.
    pub async fn connect_server(&self, address: Address, protocol: &str) -> Result<(String, BoxedStream)> {
        let mut server = Server::new(address.clone());
        server.protocol = Some(protocol.to_string());
        server.timestamp_start = Some(now());
        let server_id = self.registry.add_server(server).await;
        if let Ok(mut servers) = self.servers.lock() {
            servers.push(server_id.clone());
        }

        debug!(client = %self.client_id, server = %server_id, host = %address.0, port = address.1, "connecting");
        match self.connector.connect(&address).await {
            Ok(connected) => {
                self.registry
                    .update_server(&server_id, |s| {
                        s.peername = connected.peername.clone();
                        s.sockname = connected.sockname.clone();
                        s.state = ConnectionState::OPEN;
                        s.timestamp_tcp_setup = Some(now());
                    })
                    .await;
                Ok((server_id, connected.stream))
            }
            Err(e) => {
                warn!(host = %address.0, port = address.1, error = %e, "server connection failed");
                self.registry
                    .close_server(&server_id, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn close_server(&self, server_id: &str, error: Option<String>) {
        self.registry.close_server(server_id, error).await;
    }

    pub async fn set_client_protocol(&self, protocol: &str) {
        self.registry
            .update_client(&self.client_id, |c| c.protocol = Some(protocol.to_string()))
            .await;
    }

    /// Close the client and drop it, and every server it used, from the registry.
    pub async fn finish(&self, error: Option<String>) {
        let servers = self
            .servers
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        for server in &servers {
            self.registry.close_server(server, None).await;
        }
        self.registry.close_client(&self.client_id, error).await;
        self.registry.remove_client(&self.client_id, &servers).await;
    }
}
