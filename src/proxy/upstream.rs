//! Server-side connections.
//!
//! Connecting goes through [`ServerConnector`] so tests can hand out in-memory
//! streams. An [`Upstream`] then carries one request at a time to the server,
//! over HTTP/1.1 or over a dedicated HTTP/2 connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::connection::{address_of, Address};
use crate::http::http1::{self, BodySize, ReadOptions};
use crate::http::http2::{
    request_to_h2, response_from_h2, ErrorCode, H2Event, Http2Connection, Http2Settings, Role,
};
use crate::http::{Content, FirstLineFormat, Message, Request, Response};
use crate::stream::{Reader, Writer};
use crate::utils::now;
use crate::{Error, Result};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A freshly opened server connection.
pub struct Connected {
    pub stream: BoxedStream,
    pub peername: Option<Address>,
    pub sockname: Option<Address>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("peername", &self.peername)
            .field("sockname", &self.sockname)
            .finish()
    }
}

#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<Connected>;
}

/// Plain TCP connections with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ServerConnector for TcpConnector {
    async fn connect(&self, address: &Address) -> Result<Connected> {
        let (host, port) = address;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), *port)))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {}:{} timed out", host, port),
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Connected {
            peername: stream.peer_addr().ok().map(address_of),
            sockname: stream.local_addr().ok().map(address_of),
            stream: Box::new(stream),
        })
    }
}

pub type UpReader = Reader<ReadHalf<BoxedStream>>;
pub type UpWriter = Writer<WriteHalf<BoxedStream>>;

/// HTTP/1.1 connection to a server, reusable while both sides keep it alive.
pub struct Http1Upstream {
    reader: UpReader,
    writer: UpWriter,
    options: ReadOptions,
    /// Cleared once a response was delimited by the server closing.
    reusable: bool,
}

impl Http1Upstream {
    pub fn new(stream: BoxedStream, options: ReadOptions) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            reader: Reader::new(read_half),
            writer: Writer::new(write_half),
            options,
            reusable: true,
        }
    }

    /// Send `request` in origin form; absolute targets are only meant for proxies.
    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        let data = if request.first_line_format == FirstLineFormat::Absolute {
            let mut origin = request.clone();
            origin.first_line_format = FirstLineFormat::Relative;
            http1::assemble_request(&origin)?
        } else {
            http1::assemble_request(request)?
        };
        trace!(bytes = data.len(), "sending request upstream");
        self.writer.send(&data).await
    }

    /// Response head, skipping interim `1xx` responses other than `101`.
    pub async fn read_response_head(&mut self) -> Result<Response> {
        loop {
            self.reader.reset_timestamps();
            let response = http1::read_response_head(&mut self.reader).await?;
            if response.is_informational() && !response.is_upgrade() {
                debug!(status = response.status_code, "skipping interim response");
                continue;
            }
            return Ok(response);
        }
    }

    pub async fn read_response_body(
        &mut self,
        request: &Request,
        response: &mut Response,
    ) -> Result<()> {
        let size = http1::expected_http_body_size(
            request,
            Some(response),
            self.options.reject_ambiguous_framing,
        )?;
        if size == BodySize::UntilEof {
            self.reusable = false;
        }
        http1::read_response_body(&mut self.reader, request, response, &self.options).await
    }

    /// Whether another request may be sent on this connection.
    pub fn is_reusable(&self) -> bool {
        self.reusable && !self.reader.is_eof()
    }

    pub fn into_parts(self) -> (UpReader, UpWriter) {
        (self.reader, self.writer)
    }
}

/// One request over its own HTTP/2 connection, on stream 1.
pub struct Http2Upstream {
    conn: Http2Connection<ReadHalf<BoxedStream>, WriteHalf<BoxedStream>>,
    stream_id: Option<u32>,
    body_expected: bool,
}

impl Http2Upstream {
    pub async fn handshake(stream: BoxedStream) -> Result<Self> {
        let (read_half, write_half) = split(stream);
        let settings = Http2Settings {
            enable_push: false,
            ..Http2Settings::default()
        };
        let mut conn = Http2Connection::new(
            Role::Client,
            Reader::new(read_half),
            Writer::new(write_half),
            settings,
        );
        conn.perform_client_preface().await?;
        Ok(Self {
            conn,
            stream_id: None,
            body_expected: false,
        })
    }

    fn stream_id(&self) -> Result<u32> {
        self.stream_id
            .ok_or_else(|| Error::internal("no request sent on this HTTP/2 connection"))
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        if request.core.content.is_missing() {
            return Err(Error::CannotAssemble);
        }
        let stream_id = self.conn.next_stream_id();
        self.stream_id = Some(stream_id);
        let headers = request_to_h2(request);
        let body = request.content().unwrap_or_default();
        self.conn
            .send_headers(stream_id, &headers, body.is_empty())
            .await?;
        if !body.is_empty() {
            self.conn
                .send_data(stream_id, Bytes::copy_from_slice(body), true)
                .await?;
        }
        Ok(())
    }

    pub async fn read_response_head(&mut self) -> Result<Response> {
        let stream_id = self.stream_id()?;
        loop {
            let (id, headers, body_expected) = self
                .conn
                .read_headers(Some(stream_id), log_unexpected)
                .await?;
            let mut response = response_from_h2(id, headers)?;
            if response.is_informational() {
                debug!(status = response.status_code, "skipping interim response");
                continue;
            }
            response.core.timestamp_start = Some(now());
            self.body_expected = body_expected;
            return Ok(response);
        }
    }

    pub async fn read_response_body(&mut self, response: &mut Response) -> Result<()> {
        let stream_id = self.stream_id()?;
        let body = if self.body_expected {
            self.conn.read_body(stream_id, log_unexpected).await?.to_vec()
        } else {
            Vec::new()
        };
        response.core.content = Content::Data(body);
        response.core.timestamp_end = Some(now());
        self.conn.forget_stream(stream_id);
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn
            .send_goaway(ErrorCode::NoError, b"")
            .await?;
        self.conn.shutdown().await
    }
}

fn log_unexpected(event: H2Event) {
    trace!(?event, "ignoring event on upstream connection");
}

/// The server side of one flow.
pub enum Upstream {
    Http1(Http1Upstream),
    Http2(Http2Upstream),
}

impl Upstream {
    pub fn protocol(&self) -> &'static str {
        match self {
            Upstream::Http1(_) => "http/1.1",
            Upstream::Http2(_) => "h2",
        }
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        match self {
            Upstream::Http1(up) => up.send_request(request).await,
            Upstream::Http2(up) => up.send_request(request).await,
        }
    }

    pub async fn read_response_head(&mut self) -> Result<Response> {
        match self {
            Upstream::Http1(up) => up.read_response_head().await,
            Upstream::Http2(up) => up.read_response_head().await,
        }
    }

    pub async fn read_response_body(
        &mut self,
        request: &Request,
        response: &mut Response,
    ) -> Result<()> {
        match self {
            Upstream::Http1(up) => up.read_response_body(request, response).await,
            Upstream::Http2(up) => up.read_response_body(response).await,
        }
    }
}
