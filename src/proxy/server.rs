//! Accept loop and per-connection protocol dispatch.

use std::sync::Arc;
use tokio::io::{split, AsyncRead};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProxyMode};
use crate::connection::{address_of, Address, Client};
use crate::http::http2::CONNECTION_PREFACE;
use crate::proxy::context::Context;
use crate::proxy::layers::{
    ClientReader, ClientWriter, Http1Layer, Http1Outcome, Http2Layer, TcpLayer,
};
use crate::proxy::upstream::BoxedStream;
use crate::stream::{Reader, Writer};
use crate::{Error, Result};

/// What the first bytes of a client connection look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Tcp,
    /// The client closed without sending anything.
    Closed,
}

#[derive(Debug)]
pub struct ProxyServer {
    config: Arc<Config>,
    ctx: Context,
}

impl ProxyServer {
    /// `ctx` is the template every client context is derived from.
    pub fn new(config: Arc<Config>, ctx: Context) -> Self {
        Self { config, ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", addr);
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "could not set TCP_NODELAY");
                    }
                    let sockname = stream.local_addr().ok().map(address_of);
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        handle_client(ctx, Box::new(stream), address_of(addr), sockname).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Serve one client connection from accept to close.
pub async fn handle_client(
    template: Context,
    stream: BoxedStream,
    peername: Address,
    sockname: Option<Address>,
) {
    let mode = match template.options.mode {
        ProxyMode::Regular => "regular",
        ProxyMode::Reverse => "reverse",
    };
    let client = Client::new(peername.clone(), sockname, mode);
    let client_id = template.registry.add_client(client).await;
    let ctx = template.for_client(client_id);
    info!(client = %ctx.client_id, peer = %format!("{}:{}", peername.0, peername.1), "client connected");

    let (read_half, write_half) = split(stream);
    let result = dispatch(ctx.clone(), Reader::new(read_half), Writer::new(write_half)).await;
    if let Err(e) = &result {
        warn!(client = %ctx.client_id, error = %e, "client connection failed");
    }
    ctx.finish(result.err().map(|e| e.to_string())).await;
    info!(client = %ctx.client_id, "client disconnected");
}

async fn dispatch(mut ctx: Context, mut reader: ClientReader, mut writer: ClientWriter) -> Result<()> {
    loop {
        let protocol = detect_protocol(&ctx, &mut reader).await?;
        debug!(client = %ctx.client_id, ?protocol, tunnel = ?ctx.tunnel_target, "detected protocol");
        match protocol {
            Protocol::Closed => return Ok(()),
            Protocol::Http2 => {
                ctx.set_client_protocol("h2").await;
                return Http2Layer::new(ctx, reader, writer).run().await;
            }
            Protocol::Tcp => {
                let address = raw_target(&ctx)
                    .ok_or_else(|| Error::internal("raw TCP without a target"))?;
                ctx.set_client_protocol("tcp").await;
                let (server_id, stream) = ctx.connect_server(address, "tcp").await?;
                let (sr, sw) = split(stream);
                let server = (Reader::new(sr), Writer::new(sw));
                TcpLayer::new(ctx, (reader, writer), server, server_id)
                    .run()
                    .await;
                return Ok(());
            }
            Protocol::Http1 => {
                ctx.set_client_protocol("http/1.1").await;
                match Http1Layer::new(ctx.clone(), reader, writer).run().await? {
                    Http1Outcome::Closed => return Ok(()),
                    Http1Outcome::Connect {
                        address,
                        reader: tunnel_reader,
                        writer: tunnel_writer,
                    } => {
                        ctx = ctx.with_tunnel_target(address);
                        reader = tunnel_reader;
                        writer = tunnel_writer;
                    }
                    Http1Outcome::Upgrade {
                        reader,
                        writer,
                        server,
                        server_id,
                    } => {
                        ctx.set_client_protocol("tcp").await;
                        TcpLayer::new(ctx, (reader, writer), server.into_parts(), server_id)
                            .run()
                            .await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn raw_target(ctx: &Context) -> Option<Address> {
    ctx.tunnel_target
        .clone()
        .or_else(|| ctx.options.reverse_target.clone())
}

/// Classify a connection by peeking at what the client sent first.
pub async fn detect_protocol<R: AsyncRead + Unpin>(
    ctx: &Context,
    reader: &mut Reader<R>,
) -> Result<Protocol> {
    let first = match reader.peek(1).await?.first() {
        Some(byte) => *byte,
        None => return Ok(Protocol::Closed),
    };

    if ctx.options.http2 && first == CONNECTION_PREFACE[0] {
        let start = reader.peek(3).await?;
        if start == &CONNECTION_PREFACE[..3] {
            let preface = reader.peek(CONNECTION_PREFACE.len()).await?;
            if preface == CONNECTION_PREFACE {
                return Ok(Protocol::Http2);
            }
        }
    }

    if first.is_ascii_uppercase() {
        return Ok(Protocol::Http1);
    }
    if ctx.options.rawtcp && raw_target(ctx).is_some() {
        return Ok(Protocol::Tcp);
    }
    Ok(Protocol::Http1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::http1::{read_response, ReadOptions};
    use crate::http::{Message, Request};
    use crate::proxy::context::ContextOptions;
    use crate::proxy::testing::{context, context_with, OriginConnector};
    use crate::proxy::upstream::TcpConnector;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn detect(ctx: &Context, data: &'static [u8]) -> Protocol {
        let mut reader = Reader::new(data);
        detect_protocol(ctx, &mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_detect_protocol() {
        let ctx = context(Arc::new(OriginConnector::new()));
        assert_eq!(detect(&ctx, b"").await, Protocol::Closed);
        assert_eq!(detect(&ctx, b"GET / HTTP/1.1\r\n\r\n").await, Protocol::Http1);
        assert_eq!(detect(&ctx, CONNECTION_PREFACE).await, Protocol::Http2);
        assert_eq!(detect(&ctx, b"PUT / HTTP/1.1\r\n\r\n").await, Protocol::Http1);
        // No target to relay to.
        assert_eq!(detect(&ctx, b"\x16\x03\x01").await, Protocol::Http1);

        let tunnelled = ctx.with_tunnel_target(("example.com".to_string(), 443));
        assert_eq!(detect(&tunnelled, b"\x16\x03\x01").await, Protocol::Tcp);

        let options = ContextOptions {
            http2: false,
            ..ContextOptions::default()
        };
        let no_h2 = context_with(options, Arc::new(OriginConnector::new()));
        assert_eq!(detect(&no_h2, CONNECTION_PREFACE).await, Protocol::Http1);
    }

    #[tokio::test]
    async fn test_connect_then_http_inside_tunnel() {
        let origin = OriginConnector::new();
        let ctx = context(Arc::new(origin.clone()));
        let registry = ctx.registry.clone();
        let (proxy_side, client) = duplex(1 << 16);
        let handler = tokio::spawn(handle_client(
            ctx,
            Box::new(proxy_side),
            ("127.0.0.1".to_string(), 50000),
            None,
        ));

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"CONNECT internal:8080 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(
            &r.read_line(1024).await.unwrap()[..],
            b"HTTP/1.1 200 Connection established\r\n"
        );
        assert_eq!(&r.read_line(1024).await.unwrap()[..], b"\r\n");

        w.write_all(b"GET /inner HTTP/1.1\r\nHost: internal\r\n\r\n")
            .await
            .unwrap();
        let request = Request::relative("GET", "/inner", "HTTP/1.1");
        let response = read_response(&mut r, &request, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content().unwrap(), b"GET /inner");
        assert_eq!(origin.addresses(), vec![("internal".to_string(), 8080)]);

        w.shutdown().await.unwrap();
        handler.await.unwrap();
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_then_raw_tcp() {
        let origin = OriginConnector::new();
        let ctx = context(Arc::new(origin.clone()));
        let (proxy_side, client) = duplex(1 << 16);
        let handler = tokio::spawn(handle_client(
            ctx,
            Box::new(proxy_side),
            ("127.0.0.1".to_string(), 50001),
            None,
        ));

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
        r.read_line(1024).await.unwrap();
        r.read_line(1024).await.unwrap();

        w.write_all(b"\x16\x03\x01hello").await.unwrap();
        assert_eq!(&r.read_exact(8).await.unwrap()[..], b"\x16\x03\x01hello");
        w.shutdown().await.unwrap();
        assert!(r.read_to_end(None).await.unwrap().is_empty());
        handler.await.unwrap();
        assert_eq!(origin.addresses(), vec![("example.com".to_string(), 443)]);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /hello HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let config = Config {
            listen_port: 0,
            ..Config::default()
        };
        let ctx = Context::new(
            ContextOptions::default(),
            Arc::new(crate::connection::ConnectionRegistry::new()),
            crate::proxy::hooks::AddonManager::new(),
            crate::proxy::intercept::Interceptor::disabled(),
            Arc::new(TcpConnector::new(Duration::from_secs(5))),
        );
        let server = ProxyServer::new(Arc::new(config), ctx);
        let listener = server.bind().await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{port}/hello HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
            port = origin_port
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hello"));
    }
}
