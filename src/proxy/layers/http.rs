//! HTTP/1 client connections.
//!
//! Requests are handled strictly one after another: read, hooks, intercept,
//! forward, hooks, intercept, respond. A killed flow or a fatal error ends the
//! whole connection.

use tracing::{debug, info, warn};

use super::{fill_target, ClientReader, ClientWriter};
use crate::config::ProxyMode;
use crate::connection::Address;
use crate::flow::{FlowError, HTTPFlow};
use crate::http::http1;
use crate::http::http2::response_to_http1;
use crate::http::{Content, Request, Response};
use crate::proxy::context::Context;
use crate::proxy::hooks::Addon;
use crate::proxy::upstream::Http1Upstream;
use crate::{Error, Result};

/// How an HTTP/1 connection ended.
pub enum Http1Outcome {
    Closed,
    /// The client asked for a tunnel to `address`; what follows on the
    /// connection is the tunnelled content.
    Connect {
        address: Address,
        reader: ClientReader,
        writer: ClientWriter,
    },
    /// Protocol switch: both connections now carry opaque bytes.
    Upgrade {
        reader: ClientReader,
        writer: ClientWriter,
        server: Http1Upstream,
        server_id: String,
    },
}

impl std::fmt::Debug for Http1Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Http1Outcome::Closed => write!(f, "Closed"),
            Http1Outcome::Connect { address, .. } => {
                write!(f, "Connect({}:{})", address.0, address.1)
            }
            Http1Outcome::Upgrade { server_id, .. } => write!(f, "Upgrade({})", server_id),
        }
    }
}

struct ServerConn {
    id: String,
    address: Address,
    conn: Http1Upstream,
}

enum Step {
    KeepAlive,
    Close,
    Upgrade,
}

pub struct Http1Layer {
    ctx: Context,
    reader: ClientReader,
    writer: ClientWriter,
    server: Option<ServerConn>,
}

impl Http1Layer {
    pub fn new(ctx: Context, reader: ClientReader, writer: ClientWriter) -> Self {
        Self {
            ctx,
            reader,
            writer,
            server: None,
        }
    }

    pub async fn run(mut self) -> Result<Http1Outcome> {
        loop {
            self.reader.reset_timestamps();
            let mut request = match http1::read_request_head(&mut self.reader).await {
                Ok(request) => request,
                Err(Error::ConnectionClosed(reason)) => {
                    debug!(client = %self.ctx.client_id, %reason, "client closed connection");
                    return self.close().await;
                }
                Err(e) => {
                    self.send_error(&e).await;
                    return self.close().await;
                }
            };

            if request.is_connect() {
                return self.handle_connect(request).await;
            }

            http1::expect_continue(&mut request, &mut self.writer).await?;
            let body =
                http1::read_request_body(&mut self.reader, &mut request, self.ctx.read_options())
                    .await;
            fill_target(&self.ctx, &mut request);
            if let Err(e) = body {
                let mut flow = HTTPFlow::new(self.ctx.client_id.clone(), request);
                self.reject(&mut flow, e).await;
                return self.close().await;
            }
            debug!(client = %self.ctx.client_id, method = %request.method, url = %request.url(), "request");

            let mut flow = HTTPFlow::new(self.ctx.client_id.clone(), request);
            match self.handle_flow(&mut flow).await? {
                Step::KeepAlive => continue,
                Step::Close => return self.close().await,
                Step::Upgrade => {
                    let Some(server) = self.server.take() else {
                        return Err(Error::internal("upgrade without a server connection"));
                    };
                    info!(flow = %flow.id(), "switching protocols");
                    return Ok(Http1Outcome::Upgrade {
                        reader: self.reader,
                        writer: self.writer,
                        server: server.conn,
                        server_id: server.id,
                    });
                }
            }
        }
    }

    async fn handle_connect(mut self, request: Request) -> Result<Http1Outcome> {
        if self.ctx.options.mode != ProxyMode::Regular {
            let e = Error::bad_preamble("CONNECT is only supported in regular proxy mode");
            self.send_error(&e).await;
            return self.close().await;
        }
        let (Some(host), Some(port)) = (request.host.clone(), request.port) else {
            let e = Error::bad_preamble("CONNECT without a target");
            self.send_error(&e).await;
            return self.close().await;
        };
        self.writer
            .send(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        info!(client = %self.ctx.client_id, %host, port, "tunnel established");
        Ok(Http1Outcome::Connect {
            address: (host, port),
            reader: self.reader,
            writer: self.writer,
        })
    }

    async fn handle_flow(&mut self, flow: &mut HTTPFlow) -> Result<Step> {
        self.ctx.addons.request(flow).await;
        if self.ctx.interceptor.intercept(flow).await.is_err() {
            return Ok(self.killed(flow).await);
        }

        if flow.response.is_none() {
            if let Err(e) = self.forward(flow).await {
                return self.fail(flow, e).await;
            }
        }

        if self.ctx.interceptor.intercept(flow).await.is_err() {
            return Ok(self.killed(flow).await);
        }
        self.ctx.addons.response(flow).await;

        let Some(response) = flow.response.as_mut() else {
            let e = Error::internal("response removed by an addon");
            return self.fail(flow, e).await;
        };
        response_to_http1(response);
        let data = match http1::assemble_response(response) {
            Ok(data) => data,
            Err(e) => return self.fail(flow, e).await,
        };
        self.writer.send(&data).await?;
        flow.flow.mark_complete();

        let response = flow.response.as_ref().ok_or_else(|| Error::internal("response vanished"))?;
        if response.is_upgrade() && self.server.is_some() {
            return Ok(Step::Upgrade);
        }
        let client_close =
            http1::connection_close(&flow.request.core.http_version, &flow.request.core.headers);
        let server_close =
            http1::connection_close(&response.core.http_version, &response.core.headers);
        let server_gone = self.server.as_ref().is_some_and(|s| !s.conn.is_reusable());
        if server_close || server_gone {
            self.drop_server(None).await;
        }
        Ok(if client_close || server_close {
            Step::Close
        } else {
            Step::KeepAlive
        })
    }

    /// Send the request upstream and read the response into the flow.
    async fn forward(&mut self, flow: &mut HTTPFlow) -> Result<()> {
        let address = self.ctx.upstream_address(&flow.request)?;
        let mut server = self.server_for(address).await?;
        flow.flow.server_conn = Some(server.id.clone());

        let result = exchange(&self.ctx, &mut server, flow).await;
        match result {
            Ok(()) => {
                self.server = Some(server);
                Ok(())
            }
            Err(e) => {
                self.ctx.close_server(&server.id, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// The kept-alive server connection if it goes to `address`, else a new one.
    async fn server_for(&mut self, address: Address) -> Result<ServerConn> {
        match self.server.take() {
            Some(server) if server.address == address => {
                debug!(server = %server.id, "reusing server connection");
                return Ok(server);
            }
            Some(server) => self.ctx.close_server(&server.id, None).await,
            None => {}
        }
        let (id, stream) = self.ctx.connect_server(address.clone(), "http/1.1").await?;
        Ok(ServerConn {
            id,
            address,
            conn: Http1Upstream::new(stream, *self.ctx.read_options()),
        })
    }

    async fn drop_server(&mut self, error: Option<String>) {
        if let Some(server) = self.server.take() {
            self.ctx.close_server(&server.id, error).await;
        }
    }

    async fn killed(&mut self, flow: &mut HTTPFlow) -> Step {
        info!(flow = %flow.id(), "flow killed, closing connection");
        self.ctx.addons.error(flow).await;
        Step::Close
    }

    /// Record `error` on the flow and answer with a 502.
    async fn fail(&mut self, flow: &mut HTTPFlow, error: Error) -> Result<Step> {
        warn!(flow = %flow.id(), url = %flow.request.url(), error = %error, "flow failed");
        flow.flow.set_error(FlowError::from(&error));
        self.ctx.addons.error(flow).await;
        self.drop_server(Some(error.to_string())).await;

        let response = Response::error(502, &error.to_string());
        let data = http1::assemble_response(&response)?;
        if let Err(e) = self.writer.send(&data).await {
            debug!(error = %e, "could not deliver error response");
        }
        Ok(Step::Close)
    }

    /// Record a request whose body could not be read, then answer it.
    async fn reject(&mut self, flow: &mut HTTPFlow, error: Error) {
        flow.flow.set_error(FlowError::from(&error));
        self.ctx.addons.error(flow).await;
        self.send_error(&error).await;
    }

    /// Answer a request that could not be read.
    async fn send_error(&mut self, error: &Error) {
        let status = match error {
            Error::BodyTooLarge(_) => 413,
            _ => 400,
        };
        info!(client = %self.ctx.client_id, status, error = %error, "rejecting request");
        let response = Response::error(status, &error.to_string());
        match http1::assemble_response(&response) {
            Ok(data) => {
                if let Err(e) = self.writer.send(&data).await {
                    debug!(error = %e, "could not deliver error response");
                }
            }
            Err(e) => debug!(error = %e, "could not assemble error response"),
        }
    }

    async fn close(mut self) -> Result<Http1Outcome> {
        self.drop_server(None).await;
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "client shutdown failed");
        }
        Ok(Http1Outcome::Closed)
    }
}

async fn exchange(ctx: &Context, server: &mut ServerConn, flow: &mut HTTPFlow) -> Result<()> {
    server.conn.send_request(&flow.request).await?;
    let head = server.conn.read_response_head().await?;
    debug!(flow = %flow.id(), status = head.status_code, "response headers");
    flow.response = Some(head);
    ctx.addons.responseheaders(flow).await;

    let mut response = flow
        .response
        .take()
        .ok_or_else(|| Error::internal("response removed by an addon"))?;
    if response.is_upgrade() {
        response.core.content = Content::Data(Vec::new());
    } else {
        server
            .conn
            .read_response_body(&flow.request, &mut response)
            .await?;
    }
    flow.response = Some(response);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::http::http1::{read_response, ReadOptions};
    use crate::http::{Headers, Message};
    use crate::proxy::hooks::{AddonManager, MockAddon};
    use crate::proxy::intercept::Interceptor;
    use crate::proxy::testing::{client_pair, context, OriginConnector, RefusingConnector};
    use crate::stream::Reader;
    use std::sync::Arc;
    use tokio::io::{split, AsyncWriteExt};

    async fn read_reply<R: tokio::io::AsyncRead + Unpin>(reader: &mut Reader<R>, method: &str) -> Response {
        let request = Request::relative(method, "/", "HTTP/1.1");
        read_response(reader, &request, &ReadOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keep_alive_requests_in_order() {
        let origin = OriginConnector::new();
        let ctx = context(Arc::new(origin.clone()));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(
            b"GET http://example.com/one HTTP/1.1\r\nHost: example.com\r\n\r\n\
              POST http://example.com/two HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await
        .unwrap();

        let first = read_reply(&mut r, "GET").await;
        assert_eq!(first.content().unwrap(), b"GET /one");
        let second = read_reply(&mut r, "POST").await;
        assert_eq!(second.content().unwrap(), b"POST /two abc");
        assert_eq!(origin.connections(), 1);

        w.shutdown().await.unwrap();
        assert!(matches!(layer.await.unwrap().unwrap(), Http1Outcome::Closed));
    }

    #[tokio::test]
    async fn test_crafted_response_skips_server() {
        let origin = OriginConnector::new();
        let mut mock = MockAddon::new();
        mock.expect_request().returning(|flow| {
            flow.response = Some(Response::make(
                418,
                b"teapot".to_vec(),
                Headers::from_iter([("Connection", "close")]),
            ));
        });
        mock.expect_response().times(1).returning(|_| ());
        let mut addons = AddonManager::new();
        addons.add(mock);

        let mut ctx = context(Arc::new(origin.clone()));
        ctx.addons = Arc::new(addons);
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n").await.unwrap();
        let response = read_reply(&mut r, "GET").await;
        assert_eq!(response.status_code, 418);
        assert_eq!(response.content().unwrap(), b"teapot");
        assert_eq!(origin.connections(), 0);
        layer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_killed_flow_closes_connection() {
        let (interceptor, mut rx) = Interceptor::new(Filter::new("~p /secret").unwrap(), None);
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                pending.kill();
            }
        });
        let mut mock = MockAddon::new();
        mock.expect_request().returning(|_| ());
        mock.expect_error()
            .times(1)
            .withf(|flow| flow.flow.is_killed())
            .returning(|_| ());
        let mut addons = AddonManager::new();
        addons.add(mock);

        let origin = OriginConnector::new();
        let mut ctx = context(Arc::new(origin.clone()));
        ctx.interceptor = interceptor;
        ctx.addons = Arc::new(addons);
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"GET http://example.com/secret HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(r.read_to_end(None).await.unwrap().is_empty());
        assert_eq!(origin.connections(), 0);
        assert!(matches!(layer.await.unwrap().unwrap(), Http1Outcome::Closed));
    }

    #[tokio::test]
    async fn test_bad_request_gets_400() {
        let ctx = context(Arc::new(OriginConnector::new()));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n").await.unwrap();
        let response = read_reply(&mut r, "GET").await;
        assert_eq!(response.status_code, 400);
        layer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_gets_502() {
        let mut mock = MockAddon::new();
        mock.expect_request().returning(|_| ());
        mock.expect_error()
            .times(1)
            .withf(|flow| flow.flow.error.is_some())
            .returning(|_| ());
        let mut addons = AddonManager::new();
        addons.add(mock);

        let mut ctx = context(Arc::new(RefusingConnector));
        ctx.addons = Arc::new(addons);
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n").await.unwrap();
        let response = read_reply(&mut r, "GET").await;
        assert_eq!(response.status_code, 502);
        layer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_hands_over_connection() {
        let ctx = context(Arc::new(OriginConnector::new()));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\nGET / HTTP/1.1\r\n")
            .await
            .unwrap();
        let line = r.read_line(1024).await.unwrap();
        assert_eq!(&line[..], b"HTTP/1.1 200 Connection established\r\n");

        match layer.await.unwrap().unwrap() {
            Http1Outcome::Connect { address, reader, .. } => {
                assert_eq!(address, ("example.com".to_string(), 8443));
                assert!(reader.buffered().starts_with(b"GET / HTTP/1.1"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upgrade_hands_over_both_connections() {
        let ctx = context(Arc::new(OriginConnector::new()));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(
            b"GET http://example.com/upgrade HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        )
        .await
        .unwrap();
        let response = read_reply(&mut r, "GET").await;
        assert_eq!(response.status_code, 101);
        assert!(matches!(
            layer.await.unwrap().unwrap(),
            Http1Outcome::Upgrade { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_delimited_response_opens_new_connection() {
        let origin = OriginConnector::new();
        let ctx = context(Arc::new(origin.clone()));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(
            b"GET http://example.com/until-eof HTTP/1.1\r\n\r\n\
              GET http://example.com/two HTTP/1.1\r\n\r\n",
        )
        .await
        .unwrap();

        let first = read_reply(&mut r, "GET").await;
        assert_eq!(first.status_code, 200);
        assert_eq!(first.content().unwrap(), b"until-eof");
        let second = read_reply(&mut r, "GET").await;
        assert_eq!(second.status_code, 200);
        assert_eq!(second.content().unwrap(), b"GET /two");
        assert_eq!(origin.connections(), 2);

        w.shutdown().await.unwrap();
        assert!(matches!(layer.await.unwrap().unwrap(), Http1Outcome::Closed));
    }

    #[tokio::test]
    async fn test_bad_chunked_body_reaches_error_hook() {
        let mut mock = MockAddon::new();
        mock.expect_error()
            .times(1)
            .withf(|flow| {
                flow.request.path.as_deref() == Some("/upload")
                    && flow.flow.error.as_ref().is_some_and(|e| e.kind == "BadChunk")
            })
            .returning(|_| ());
        let mut addons = AddonManager::new();
        addons.add(mock);

        let origin = OriginConnector::new();
        let mut ctx = context(Arc::new(origin.clone()));
        ctx.addons = Arc::new(addons);
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http1Layer::new(ctx, reader, writer).run());

        let (r, mut w) = split(client);
        let mut r = Reader::new(r);
        w.write_all(
            b"POST http://example.com/upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        )
        .await
        .unwrap();
        let response = read_reply(&mut r, "POST").await;
        assert_eq!(response.status_code, 400);
        assert_eq!(origin.connections(), 0);
        assert!(matches!(layer.await.unwrap().unwrap(), Http1Outcome::Closed));
    }
}
