//! Raw TCP relay.
//!
//! Bytes are passed through as they arrive, each chunk recorded as a message
//! on a [`TCPFlow`]. Addons see every message and may rewrite it before it is
//! forwarded. A half-close on one side is propagated to the other.

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{ClientReader, ClientWriter};
use crate::flow::{FlowError, TCPFlow};
use crate::proxy::context::Context;
use crate::proxy::hooks::Addon;
use crate::proxy::upstream::{UpReader, UpWriter};
use crate::Result;

const CHUNK_SIZE: usize = 16 * 1024;

pub struct TcpLayer {
    ctx: Context,
    client_reader: ClientReader,
    client_writer: ClientWriter,
    server_reader: UpReader,
    server_writer: UpWriter,
    server_id: String,
}

impl TcpLayer {
    pub fn new(
        ctx: Context,
        client: (ClientReader, ClientWriter),
        server: (UpReader, UpWriter),
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            client_reader: client.0,
            client_writer: client.1,
            server_reader: server.0,
            server_writer: server.1,
            server_id: server_id.into(),
        }
    }

    /// Relay until both directions are closed. Returns the finished flow.
    pub async fn run(mut self) -> TCPFlow {
        let mut flow = TCPFlow::new(self.ctx.client_id.clone(), self.server_id.clone());
        info!(flow = %flow.id(), client = %self.ctx.client_id, server = %self.server_id, "tcp relay started");
        self.ctx.addons.tcp_start(&mut flow).await;

        let result = self.relay(&mut flow).await;
        if let Err(e) = &result {
            warn!(flow = %flow.id(), error = %e, "tcp relay failed");
            flow.flow.set_error(FlowError::from(e));
            self.ctx.addons.tcp_error(&mut flow).await;
        }
        self.ctx.addons.tcp_end(&mut flow).await;
        flow.flow.mark_complete();

        let error = result.err().map(|e| e.to_string());
        self.ctx.close_server(&self.server_id, error).await;
        debug!(flow = %flow.id(), messages = flow.messages.len(), "tcp relay finished");
        flow
    }

    async fn relay(&mut self, flow: &mut TCPFlow) -> Result<()> {
        let mut client_open = true;
        let mut server_open = true;
        while client_open || server_open {
            tokio::select! {
                data = self.client_reader.read_some(CHUNK_SIZE), if client_open => {
                    let data = data?;
                    if data.is_empty() {
                        debug!(flow = %flow.id(), "client half-closed");
                        client_open = false;
                        if let Err(e) = self.server_writer.shutdown().await {
                            debug!(error = %e, "server shutdown failed");
                        }
                        continue;
                    }
                    let data = on_message(&self.ctx, flow, true, data).await;
                    self.server_writer.send(&data).await?;
                }
                data = self.server_reader.read_some(CHUNK_SIZE), if server_open => {
                    let data = data?;
                    if data.is_empty() {
                        debug!(flow = %flow.id(), "server half-closed");
                        server_open = false;
                        if let Err(e) = self.client_writer.shutdown().await {
                            debug!(error = %e, "client shutdown failed");
                        }
                        continue;
                    }
                    let data = on_message(&self.ctx, flow, false, data).await;
                    self.client_writer.send(&data).await?;
                }
            }
        }
        Ok(())
    }
}

/// Record a chunk, run the hook and return what should be forwarded.
async fn on_message(ctx: &Context, flow: &mut TCPFlow, from_client: bool, data: Bytes) -> Vec<u8> {
    flow.push_message(from_client, data.to_vec(), ctx.options.max_tcp_messages);
    ctx.addons.tcp_message(flow).await;
    match flow.messages.last() {
        Some(message) => message.content.clone(),
        None => data.to_vec(),
    }
}
