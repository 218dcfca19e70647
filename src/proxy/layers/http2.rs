//! HTTP/2 client connections.
//!
//! One task reads frames and owns the connection. Every complete request
//! stream becomes a flow handled by its own task, so a slow or intercepted
//! stream never blocks the others. Flow tasks report back over a channel and
//! the connection task writes their responses.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{fill_target, ClientReader, ClientWriter};
use crate::flow::{FlowError, HTTPFlow};
use crate::http::http2::{
    request_from_h2, request_to_http1, response_to_h2, ErrorCode, H2Event, Http2Connection,
    Http2Settings, Role,
};
use crate::http::{Content, Message, Request, Response};
use crate::proxy::context::Context;
use crate::proxy::hooks::Addon;
use crate::proxy::upstream::{BoxedStream, Http1Upstream, Http2Upstream, Upstream};
use crate::utils::now;
use crate::{Error, Result};

const OUTCOME_QUEUE: usize = 32;

type ClientConnection = Http2Connection<ReadHalf<BoxedStream>, WriteHalf<BoxedStream>>;

/// What a flow task wants done with its stream.
#[derive(Debug)]
enum StreamOutcome {
    Respond { stream_id: u32, response: Response },
    Reset { stream_id: u32, code: ErrorCode },
}

struct PartialRequest {
    request: Request,
    body: BytesMut,
}

pub struct Http2Layer {
    ctx: Context,
    conn: ClientConnection,
    partial: HashMap<u32, PartialRequest>,
    tasks: HashMap<u32, JoinHandle<()>>,
    tx: mpsc::Sender<StreamOutcome>,
    rx: mpsc::Receiver<StreamOutcome>,
    /// Set once the client sent GOAWAY: finish what is open, accept nothing new.
    draining: bool,
}

impl Http2Layer {
    pub fn new(ctx: Context, reader: ClientReader, writer: ClientWriter) -> Self {
        let settings = Http2Settings {
            enable_push: false,
            ..Http2Settings::default()
        };
        let (tx, rx) = mpsc::channel(OUTCOME_QUEUE);
        Self {
            ctx,
            conn: Http2Connection::new(Role::Server, reader, writer, settings),
            partial: HashMap::new(),
            tasks: HashMap::new(),
            tx,
            rx,
            draining: false,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.conn.perform_server_preface().await?;
        debug!(client = %self.ctx.client_id, "HTTP/2 connection established");

        let result = self.serve().await;
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        if let Err(e) = self.conn.shutdown().await {
            debug!(error = %e, "client shutdown failed");
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            if self.draining && self.tasks.is_empty() && self.partial.is_empty() {
                debug!(client = %self.ctx.client_id, "drained after GOAWAY");
                return Ok(());
            }
            tokio::select! {
                frame = self.conn.read_frame() => {
                    let events = match frame {
                        Ok(frame) => self.conn.process_frame(frame).await,
                        Err(e) => Err(e),
                    };
                    let keep_going = match events {
                        Ok(events) => {
                            for event in events {
                                self.handle_event(event).await?;
                            }
                            true
                        }
                        Err(e) => self.handle_error(e).await?,
                    };
                    if !keep_going {
                        return Ok(());
                    }
                }
                Some(outcome) = self.rx.recv() => self.handle_outcome(outcome).await?,
            }
        }
    }

    async fn handle_event(&mut self, event: H2Event) -> Result<()> {
        match event {
            H2Event::HeadersReceived {
                stream_id,
                headers,
                end_stream,
            } => {
                if self.partial.contains_key(&stream_id) {
                    debug!(stream_id, "dropping request trailers");
                    if end_stream {
                        self.start_flow(stream_id);
                    }
                    return Ok(());
                }
                if self.draining {
                    return self.conn.reset_stream(stream_id, ErrorCode::RefusedStream).await;
                }
                let request = match request_from_h2(stream_id, headers) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(stream_id, error = %e, "malformed request");
                        return self.conn.reset_stream(stream_id, ErrorCode::ProtocolError).await;
                    }
                };
                self.partial.insert(
                    stream_id,
                    PartialRequest {
                        request,
                        body: BytesMut::new(),
                    },
                );
                if end_stream {
                    self.start_flow(stream_id);
                }
            }
            H2Event::DataReceived {
                stream_id,
                data,
                end_stream,
            } => {
                let limit = self.ctx.read_options().body_size_limit;
                let Some(partial) = self.partial.get_mut(&stream_id) else {
                    debug!(stream_id, "data for unknown stream");
                    return Ok(());
                };
                partial.body.extend_from_slice(&data);
                if limit.is_some_and(|limit| partial.body.len() > limit) {
                    if let Some(partial) = self.partial.remove(&stream_id) {
                        let error = Error::body_too_large(format!(
                            "request body exceeds limit of {} bytes",
                            limit.unwrap_or_default()
                        ));
                        self.abandon(partial, &error).await;
                    }
                    let response = Response::error(413, "Request body exceeds the size limit.");
                    return self.respond(stream_id, response).await;
                }
                if end_stream {
                    self.start_flow(stream_id);
                }
            }
            H2Event::StreamReset {
                stream_id,
                error_code,
            } => {
                debug!(stream_id, %error_code, "client reset stream");
                if let Some(partial) = self.partial.remove(&stream_id) {
                    let error = Error::connection_closed(format!(
                        "client reset stream with {} before the request was complete",
                        error_code
                    ));
                    self.abandon(partial, &error).await;
                }
                if let Some(task) = self.tasks.remove(&stream_id) {
                    task.abort();
                }
            }
            H2Event::ConnectionTerminated { error_code, .. } => {
                debug!(client = %self.ctx.client_id, %error_code, "client sent GOAWAY");
                self.draining = true;
            }
            H2Event::SettingsChanged | H2Event::WindowUpdated { .. } => {}
        }
        Ok(())
    }

    /// Report a request that will never be complete to the error hook.
    async fn abandon(&mut self, partial: PartialRequest, error: &Error) {
        let mut request = partial.request;
        request.core.content = Content::Missing;
        fill_target(&self.ctx, &mut request);
        let mut flow = HTTPFlow::new(self.ctx.client_id.clone(), request);
        warn!(flow = %flow.id(), error = %error, "incomplete request");
        flow.flow.set_error(FlowError::from(error));
        self.ctx.addons.error(&mut flow).await;
    }

    /// Spawn the flow task for a fully received request.
    fn start_flow(&mut self, stream_id: u32) {
        let Some(PartialRequest { mut request, body }) = self.partial.remove(&stream_id) else {
            return;
        };
        request.core.content = Content::Data(body.to_vec());
        request.core.timestamp_end = Some(now());
        fill_target(&self.ctx, &mut request);
        debug!(stream_id, method = %request.method, url = %request.url(), "request");

        let ctx = self.ctx.clone();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let outcome = serve_stream(ctx, stream_id, request).await;
            if tx.send(outcome).await.is_err() {
                debug!(stream_id, "connection gone before the flow finished");
            }
        });
        self.tasks.insert(stream_id, task);
    }

    async fn handle_outcome(&mut self, outcome: StreamOutcome) -> Result<()> {
        match outcome {
            StreamOutcome::Respond {
                stream_id,
                response,
            } => {
                self.tasks.remove(&stream_id);
                self.respond(stream_id, response).await
            }
            StreamOutcome::Reset { stream_id, code } => {
                self.tasks.remove(&stream_id);
                self.conn.reset_stream(stream_id, code).await
            }
        }
    }

    async fn respond(&mut self, stream_id: u32, response: Response) -> Result<()> {
        let Some(body) = response.content() else {
            warn!(stream_id, "response body is missing, resetting stream");
            return self.conn.reset_stream(stream_id, ErrorCode::InternalError).await;
        };
        let headers = response_to_h2(&response);
        let end_stream = body.is_empty();
        self.conn.send_headers(stream_id, &headers, end_stream).await?;
        if !end_stream {
            self.conn
                .send_data(stream_id, Bytes::copy_from_slice(body), true)
                .await?;
        }
        Ok(())
    }

    /// Returns whether the connection survives `error`.
    async fn handle_error(&mut self, error: Error) -> Result<bool> {
        match &error {
            Error::Http2 {
                code,
                stream_id: Some(stream_id),
                ..
            } => {
                warn!(stream_id, error = %error, "stream error");
                self.partial.remove(stream_id);
                if let Some(task) = self.tasks.remove(stream_id) {
                    task.abort();
                }
                self.conn.reset_stream(*stream_id, *code).await?;
                Ok(true)
            }
            Error::Http2 { code, .. } => {
                warn!(client = %self.ctx.client_id, error = %error, "connection error");
                self.goaway(*code, &error).await;
                Ok(false)
            }
            Error::ConnectionClosed(_) | Error::Io(_) => {
                debug!(client = %self.ctx.client_id, error = %error, "client connection closed");
                Ok(false)
            }
            _ => {
                warn!(client = %self.ctx.client_id, error = %error, "unexpected client data");
                self.goaway(ErrorCode::ProtocolError, &error).await;
                Ok(false)
            }
        }
    }

    async fn goaway(&mut self, code: ErrorCode, error: &Error) {
        if let Err(e) = self.conn.send_goaway(code, error.to_string().as_bytes()).await {
            debug!(error = %e, "could not send GOAWAY");
        }
    }
}

/// Run one flow from request hook to response hook.
async fn serve_stream(ctx: Context, stream_id: u32, request: Request) -> StreamOutcome {
    let mut flow = HTTPFlow::new(ctx.client_id.clone(), request);

    ctx.addons.request(&mut flow).await;
    if ctx.interceptor.intercept(&mut flow).await.is_err() {
        return killed(&ctx, &mut flow, stream_id).await;
    }

    if flow.response.is_none() {
        if let Err(e) = forward(&ctx, &mut flow).await {
            warn!(flow = %flow.id(), url = %flow.request.url(), error = %e, "flow failed");
            flow.flow.set_error(FlowError::from(&e));
            ctx.addons.error(&mut flow).await;
            return StreamOutcome::Respond {
                stream_id,
                response: Response::error(502, &e.to_string()),
            };
        }
    }

    if ctx.interceptor.intercept(&mut flow).await.is_err() {
        return killed(&ctx, &mut flow, stream_id).await;
    }
    ctx.addons.response(&mut flow).await;

    match flow.response.clone() {
        Some(response) => {
            flow.flow.mark_complete();
            StreamOutcome::Respond {
                stream_id,
                response,
            }
        }
        None => StreamOutcome::Reset {
            stream_id,
            code: ErrorCode::InternalError,
        },
    }
}

async fn killed(ctx: &Context, flow: &mut HTTPFlow, stream_id: u32) -> StreamOutcome {
    info!(flow = %flow.id(), stream_id, "flow killed, resetting stream");
    ctx.addons.error(flow).await;
    StreamOutcome::Reset {
        stream_id,
        code: ErrorCode::Cancel,
    }
}

/// Carry the request over a fresh server connection.
async fn forward(ctx: &Context, flow: &mut HTTPFlow) -> Result<()> {
    let address = ctx.upstream_address(&flow.request)?;
    let protocol = if ctx.options.upstream_http2 { "h2" } else { "http/1.1" };
    let (server_id, stream) = ctx.connect_server(address, protocol).await?;
    flow.flow.server_conn = Some(server_id.clone());

    let result = match open_upstream(ctx, stream).await {
        Ok(mut upstream) => {
            let result = exchange(ctx, &mut upstream, flow).await;
            if let Upstream::Http2(up) = upstream {
                if let Err(e) = up.close().await {
                    debug!(error = %e, "closing upstream HTTP/2 connection failed");
                }
            }
            result
        }
        Err(e) => Err(e),
    };
    ctx.close_server(&server_id, result.as_ref().err().map(|e| e.to_string()))
        .await;
    result
}

async fn open_upstream(ctx: &Context, stream: BoxedStream) -> Result<Upstream> {
    if ctx.options.upstream_http2 {
        Ok(Upstream::Http2(Http2Upstream::handshake(stream).await?))
    } else {
        Ok(Upstream::Http1(Http1Upstream::new(stream, *ctx.read_options())))
    }
}

async fn exchange(ctx: &Context, upstream: &mut Upstream, flow: &mut HTTPFlow) -> Result<()> {
    let mut request = flow.request.clone();
    if let Upstream::Http1(_) = upstream {
        request_to_http1(&mut request);
    }
    upstream.send_request(&request).await?;

    let head = upstream.read_response_head().await?;
    flow.response = Some(head);
    ctx.addons.responseheaders(flow).await;

    let mut response = flow
        .response
        .take()
        .ok_or_else(|| Error::internal("response removed by an addon"))?;
    upstream.read_response_body(&request, &mut response).await?;
    flow.response = Some(response);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::http::http2::{request_to_h2, response_from_h2};
    use crate::http::http1::ReadOptions;
    use crate::proxy::context::ContextOptions;
    use crate::proxy::hooks::{AddonManager, MockAddon};
    use crate::proxy::intercept::Interceptor;
    use crate::proxy::testing::{client_pair, context_with, OriginConnector, RefusingConnector};
    use crate::stream::{Reader, Writer};
    use std::sync::Arc;
    use tokio::io::{split, AsyncWriteExt};

    fn record_resets(resets: &mut Vec<(u32, ErrorCode)>, event: H2Event) {
        if let H2Event::StreamReset {
            stream_id,
            error_code,
        } = event
        {
            resets.push((stream_id, error_code));
        }
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (interceptor, mut rx) = Interceptor::new(Filter::new("~p /kill").unwrap(), None);
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                pending.kill();
            }
        });
        let options = ContextOptions {
            upstream_http2: false,
            ..ContextOptions::default()
        };
        let origin = OriginConnector::new();
        let mut ctx = context_with(options, Arc::new(origin.clone()));
        ctx.interceptor = interceptor;

        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http2Layer::new(ctx, reader, writer).run());

        let (r, w) = split(client);
        let mut conn = Http2Connection::new(
            Role::Client,
            Reader::new(r),
            Writer::new(w),
            Http2Settings::default(),
        );
        conn.perform_client_preface().await.unwrap();

        let killed = conn.next_stream_id();
        let request = Request::absolute("GET", "http", "example.com", 80, "/kill", "HTTP/2.0");
        conn.send_headers(killed, &request_to_h2(&request), true)
            .await
            .unwrap();

        let ok = conn.next_stream_id();
        let request = Request::absolute("POST", "http", "example.com", 80, "/ok", "HTTP/2.0");
        conn.send_headers(ok, &request_to_h2(&request), false)
            .await
            .unwrap();
        conn.send_data(ok, Bytes::from_static(b"hi"), true)
            .await
            .unwrap();

        let mut resets = Vec::new();
        let (id, headers, body_expected) = conn
            .read_headers(Some(ok), |e| record_resets(&mut resets, e))
            .await
            .unwrap();
        assert!(body_expected);
        let response = response_from_h2(id, headers).unwrap();
        assert_eq!(response.status_code, 200);
        let body = conn
            .read_body(ok, |e| record_resets(&mut resets, e))
            .await
            .unwrap();
        assert_eq!(&body[..], b"POST /ok hi");

        while resets.is_empty() {
            let frame = conn.read_frame().await.unwrap();
            for event in conn.process_frame(frame).await.unwrap() {
                record_resets(&mut resets, event);
            }
        }
        assert_eq!(resets, vec![(killed, ErrorCode::Cancel)]);
        assert_eq!(origin.connections(), 1);

        conn.send_goaway(ErrorCode::NoError, b"").await.unwrap();
        layer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_answers_502() {
        let options = ContextOptions {
            upstream_http2: false,
            ..ContextOptions::default()
        };
        let ctx = context_with(options, Arc::new(RefusingConnector));
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http2Layer::new(ctx, reader, writer).run());

        let (r, w) = split(client);
        let mut conn = Http2Connection::new(
            Role::Client,
            Reader::new(r),
            Writer::new(w),
            Http2Settings::default(),
        );
        conn.perform_client_preface().await.unwrap();
        let stream_id = conn.next_stream_id();
        let request = Request::absolute("GET", "http", "example.com", 80, "/", "HTTP/2.0");
        conn.send_headers(stream_id, &request_to_h2(&request), true)
            .await
            .unwrap();

        let (id, headers, _) = conn.read_headers(Some(stream_id), |_| {}).await.unwrap();
        assert_eq!(response_from_h2(id, headers).unwrap().status_code, 502);
        drop(conn);
        layer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_preface_fails() {
        let ctx = context_with(ContextOptions::default(), Arc::new(OriginConnector::new()));
        let (reader, writer, client) = client_pair();
        let (_r, mut w) = split(client);
        w.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(Http2Layer::new(ctx, reader, writer).run().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_body_reaches_error_hook() {
        let mut mock = MockAddon::new();
        mock.expect_error()
            .times(1)
            .withf(|flow| {
                flow.request.path.as_deref() == Some("/upload")
                    && flow.flow.error.as_ref().is_some_and(|e| e.kind == "BodyTooLarge")
            })
            .returning(|_| ());
        let mut addons = AddonManager::new();
        addons.add(mock);

        let options = ContextOptions {
            read_options: ReadOptions {
                body_size_limit: Some(4),
                ..ReadOptions::default()
            },
            ..ContextOptions::default()
        };
        let origin = OriginConnector::new();
        let mut ctx = context_with(options, Arc::new(origin.clone()));
        ctx.addons = Arc::new(addons);
        let (reader, writer, client) = client_pair();
        let layer = tokio::spawn(Http2Layer::new(ctx, reader, writer).run());

        let (r, w) = split(client);
        let mut conn = Http2Connection::new(
            Role::Client,
            Reader::new(r),
            Writer::new(w),
            Http2Settings::default(),
        );
        conn.perform_client_preface().await.unwrap();
        let stream_id = conn.next_stream_id();
        let request = Request::absolute("POST", "http", "example.com", 80, "/upload", "HTTP/2.0");
        conn.send_headers(stream_id, &request_to_h2(&request), false)
            .await
            .unwrap();
        conn.send_data(stream_id, Bytes::from_static(b"far too long"), true)
            .await
            .unwrap();

        let (id, headers, _) = conn.read_headers(Some(stream_id), |_| {}).await.unwrap();
        assert_eq!(response_from_h2(id, headers).unwrap().status_code, 413);
        assert_eq!(origin.connections(), 0);

        conn.send_goaway(ErrorCode::NoError, b"").await.unwrap();
        layer.await.unwrap().unwrap();
    }
}
