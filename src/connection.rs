//! Client and server connection descriptors and the registry that owns them.
//!
//! Flows refer to connections by id only; the registry is the single owner.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::utils::now;

pub type Address = (String, u16);

pub fn address_of(addr: SocketAddr) -> Address {
    (addr.ip().to_string(), addr.port())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub can_read: bool,
    pub can_write: bool,
}

impl ConnectionState {
    pub const OPEN: Self = Self {
        can_read: true,
        can_write: true,
    };

    pub const CLOSED: Self = Self {
        can_read: false,
        can_write: false,
    };

    pub fn is_open(&self) -> bool {
        self.can_read || self.can_write
    }
}

/// Client-facing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub peername: Address,
    pub sockname: Option<Address>,
    pub state: ConnectionState,
    pub proxy_mode: String,
    /// Protocol spoken after detection: `http/1.1`, `h2` or `tcp`.
    pub protocol: Option<String>,
    pub timestamp_start: f64,
    pub timestamp_end: Option<f64>,
    pub error: Option<String>,
}

impl Client {
    pub fn new(peername: Address, sockname: Option<Address>, proxy_mode: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peername,
            sockname,
            state: ConnectionState::OPEN,
            proxy_mode: proxy_mode.to_string(),
            protocol: None,
            timestamp_start: now(),
            timestamp_end: None,
            error: None,
        }
    }
}

/// Server-facing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    /// Target as requested, before resolution.
    pub address: Address,
    pub peername: Option<Address>,
    pub sockname: Option<Address>,
    pub state: ConnectionState,
    pub protocol: Option<String>,
    pub timestamp_start: Option<f64>,
    pub timestamp_tcp_setup: Option<f64>,
    pub timestamp_end: Option<f64>,
    pub error: Option<String>,
}

impl Server {
    pub fn new(address: Address) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address,
            peername: None,
            sockname: None,
            state: ConnectionState::CLOSED,
            protocol: None,
            timestamp_start: None,
            timestamp_tcp_setup: None,
            timestamp_end: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, Client>>,
    servers: RwLock<HashMap<String, Server>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_client(&self, client: Client) -> String {
        let id = client.id.clone();
        self.clients.write().await.insert(id.clone(), client);
        id
    }

    pub async fn add_server(&self, server: Server) -> String {
        let id = server.id.clone();
        self.servers.write().await.insert(id.clone(), server);
        id
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn server(&self, id: &str) -> Option<Server> {
        self.servers.read().await.get(id).cloned()
    }

    pub async fn update_client<F: FnOnce(&mut Client)>(&self, id: &str, f: F) -> bool {
        match self.clients.write().await.get_mut(id) {
            Some(client) => {
                f(client);
                true
            }
            None => false,
        }
    }

    pub async fn update_server<F: FnOnce(&mut Server)>(&self, id: &str, f: F) -> bool {
        match self.servers.write().await.get_mut(id) {
            Some(server) => {
                f(server);
                true
            }
            None => false,
        }
    }

    /// Mark the client closed, recording `error` if given.
    pub async fn close_client(&self, id: &str, error: Option<String>) {
        self.update_client(id, |client| {
            client.state = ConnectionState::CLOSED;
            client.timestamp_end.get_or_insert_with(now);
            if error.is_some() {
                client.error = error;
            }
        })
        .await;
    }

    pub async fn close_server(&self, id: &str, error: Option<String>) {
        self.update_server(id, |server| {
            server.state = ConnectionState::CLOSED;
            server.timestamp_end.get_or_insert_with(now);
            if error.is_some() {
                server.error = error;
            }
        })
        .await;
    }

    /// Forget a finished client together with the servers it used.
    pub async fn remove_client(&self, id: &str, servers: &[String]) {
        self.clients.write().await.remove(id);
        let mut map = self.servers.write().await;
        for server in servers {
            map.remove(server);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn open_clients(&self) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.state.is_open())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_close() {
        let registry = ConnectionRegistry::new();
        let client = Client::new(("127.0.0.1".to_string(), 50000), None, "regular");
        let id = registry.add_client(client).await;

        assert_eq!(registry.open_clients().await.len(), 1);
        registry.close_client(&id, Some("reset".to_string())).await;

        let client = registry.client(&id).await.unwrap();
        assert_eq!(client.state, ConnectionState::CLOSED);
        assert!(client.timestamp_end.is_some());
        assert_eq!(client.error.as_deref(), Some("reset"));
        assert!(registry.open_clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_updates() {
        let registry = ConnectionRegistry::new();
        let id = registry
            .add_server(Server::new(("example.com".to_string(), 80)))
            .await;
        assert!(
            registry
                .update_server(&id, |s| {
                    s.state = ConnectionState::OPEN;
                    s.protocol = Some("h2".to_string());
                })
                .await
        );
        let server = registry.server(&id).await.unwrap();
        assert!(server.state.is_open());
        assert_eq!(server.protocol.as_deref(), Some("h2"));
        assert!(!registry.update_server("missing", |_| {}).await);
    }

    #[tokio::test]
    async fn test_remove_client_with_servers() {
        let registry = ConnectionRegistry::new();
        let client = registry
            .add_client(Client::new(("::1".to_string(), 1), None, "regular"))
            .await;
        let server = registry
            .add_server(Server::new(("example.com".to_string(), 443)))
            .await;
        registry.remove_client(&client, &[server.clone()]).await;
        assert_eq!(registry.client_count().await, 0);
        assert!(registry.server(&server).await.is_none());
    }
}
