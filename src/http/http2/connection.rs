//! HTTP/2 connection state machine: preface, settings, HPACK, stream ids,
//! flow control and message reconstruction from frame sequences.

use bytes::{Bytes, BytesMut};
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::frame::{
    ErrorCode, Frame, Http2FrameCodec, Http2Settings, CONNECTION_PREFACE,
    DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
use crate::http::headers::Headers;
use crate::stream::{Reader, Writer};
use crate::{Error, Result};

const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;
/// Reset stream ids remembered for dropping late frames; oldest go first.
const MAX_RESET_STREAMS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client that has not written the preface yet.
    PrefaceUnsent,
    /// Server that has not received the preface yet.
    PrefaceUnreceived,
    /// Preface exchanged, waiting for the peer's settings.
    PrefaceDone,
    Active,
    Closed,
}

/// Events surfaced by [`Http2Connection::process_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum H2Event {
    HeadersReceived {
        stream_id: u32,
        headers: Headers,
        end_stream: bool,
    },
    DataReceived {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    SettingsChanged,
    WindowUpdated {
        stream_id: u32,
    },
    ConnectionTerminated {
        error_code: ErrorCode,
        last_stream_id: u32,
    },
}

#[derive(Debug)]
struct HeaderBlock {
    stream_id: u32,
    buf: BytesMut,
    end_stream: bool,
}

#[derive(Debug)]
struct PendingData {
    stream_id: u32,
    data: Bytes,
    end_stream: bool,
}

pub struct Http2Connection<R, W> {
    role: Role,
    state: ConnectionState,
    reader: Reader<R>,
    writer: Writer<W>,
    codec: Http2FrameCodec,
    encoder: loona_hpack::Encoder<'static>,
    decoder: loona_hpack::Decoder<'static>,
    local_settings: Http2Settings,
    /// Live settings announced by the peer.
    peer_settings: Http2Settings,
    last_local_stream_id: Option<u32>,
    highest_peer_stream_id: u32,
    header_block: Option<HeaderBlock>,
    backlog: VecDeque<Frame>,
    conn_send_window: i64,
    stream_send_windows: HashMap<u32, i64>,
    pending: VecDeque<PendingData>,
    reset_streams: IndexSet<u32>,
}

impl<R, W> Http2Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(role: Role, reader: Reader<R>, writer: Writer<W>, local_settings: Http2Settings) -> Self {
        let mut codec = Http2FrameCodec::new();
        codec.set_max_frame_size(local_settings.max_frame_size);
        Self {
            role,
            state: match role {
                Role::Client => ConnectionState::PrefaceUnsent,
                Role::Server => ConnectionState::PrefaceUnreceived,
            },
            reader,
            writer,
            codec,
            encoder: loona_hpack::Encoder::new(),
            decoder: loona_hpack::Decoder::new(),
            local_settings,
            peer_settings: Http2Settings::default(),
            last_local_stream_id: None,
            highest_peer_stream_id: 0,
            header_block: None,
            backlog: VecDeque::new(),
            conn_send_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            stream_send_windows: HashMap::new(),
            pending: VecDeque::new(),
            reset_streams: IndexSet::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_settings(&self) -> &Http2Settings {
        &self.peer_settings
    }

    pub fn local_settings(&self) -> &Http2Settings {
        &self.local_settings
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Write the magic and our settings, then wait for the peer's settings and
    /// the acknowledgement of ours.
    pub async fn perform_client_preface(&mut self) -> Result<()> {
        self.writer.write(CONNECTION_PREFACE);
        self.queue(Frame::settings(self.local_settings.to_frame_settings()))?;
        self.writer.flush().await?;
        self.state = ConnectionState::PrefaceDone;

        let mut got_settings = false;
        let mut got_ack = false;
        while !(got_settings && got_ack) {
            match self.read_raw_frame().await? {
                Frame::Settings { ack: true, .. } => got_ack = true,
                Frame::Settings {
                    ack: false,
                    settings,
                } => {
                    self.apply_peer_settings(&settings)?;
                    self.writer.flush().await?;
                    got_settings = true;
                }
                other => self.backlog.push_back(other),
            }
        }
        self.state = ConnectionState::Active;
        debug!(role = ?self.role, "HTTP/2 client preface complete");
        Ok(())
    }

    /// Verify the magic, send our settings and wait for the peer's settings.
    pub async fn perform_server_preface(&mut self) -> Result<()> {
        let magic = self.reader.read_exact(CONNECTION_PREFACE.len()).await?;
        if &magic[..] != CONNECTION_PREFACE {
            self.state = ConnectionState::Closed;
            return Err(Error::http2(
                ErrorCode::ProtocolError,
                "invalid HTTP/2 connection preface",
            ));
        }
        self.state = ConnectionState::PrefaceDone;
        self.queue(Frame::settings(self.local_settings.to_frame_settings()))?;
        self.writer.flush().await?;

        loop {
            match self.read_raw_frame().await? {
                Frame::Settings {
                    ack: false,
                    settings,
                } => {
                    self.apply_peer_settings(&settings)?;
                    self.writer.flush().await?;
                    break;
                }
                Frame::Settings { ack: true, .. } => {}
                other => {
                    return Err(Error::http2(
                        ErrorCode::ProtocolError,
                        format!("expected SETTINGS after preface, got {}", other.kind()),
                    ))
                }
            }
        }
        self.state = ConnectionState::Active;
        debug!(role = ?self.role, "HTTP/2 server preface complete");
        Ok(())
    }

    /// Allocate the next locally initiated stream id.
    pub fn next_stream_id(&mut self) -> u32 {
        let next = match (self.last_local_stream_id, self.role) {
            (Some(last), _) => last + 2,
            (None, Role::Client) => 1,
            (None, Role::Server) => 2,
        };
        self.last_local_stream_id = Some(next);
        next
    }

    async fn read_raw_frame(&mut self) -> Result<Frame> {
        let frame = self.reader.read_decoded(&mut self.codec).await?;
        trace!(kind = frame.kind(), stream_id = frame.stream_id(), "received frame");
        Ok(frame)
    }

    /// Next frame from the peer. Cancel safe.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let frame = match self.backlog.pop_front() {
            Some(frame) => frame,
            None => self.read_raw_frame().await?,
        };
        if let Some(block) = &self.header_block {
            let continues = matches!(
                &frame,
                Frame::Continuation { stream_id, .. } if *stream_id == block.stream_id
            );
            if !continues {
                return Err(Error::http2(
                    ErrorCode::ProtocolError,
                    format!(
                        "expected CONTINUATION for stream {}, got {}",
                        block.stream_id,
                        frame.kind()
                    ),
                ));
            }
        }
        Ok(frame)
    }

    fn queue(&mut self, frame: Frame) -> Result<()> {
        trace!(kind = frame.kind(), stream_id = frame.stream_id(), "sending frame");
        self.writer.write_encoded(&mut self.codec, frame)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    fn apply_peer_settings(&mut self, settings: &[(u16, u32)]) -> Result<()> {
        let old_window = self.peer_settings.initial_window_size as i64;
        for (id, value) in settings {
            self.peer_settings.apply(*id, *value)?;
        }
        let delta = self.peer_settings.initial_window_size as i64 - old_window;
        if delta != 0 {
            for window in self.stream_send_windows.values_mut() {
                *window += delta;
            }
        }
        self.queue(Frame::settings_ack())
    }

    fn open_stream(&mut self, stream_id: u32) {
        self.stream_send_windows
            .entry(stream_id)
            .or_insert(self.peer_settings.initial_window_size as i64);
    }

    /// Drop per-stream state once a stream is done.
    pub fn forget_stream(&mut self, stream_id: u32) {
        self.stream_send_windows.remove(&stream_id);
        self.pending.retain(|p| p.stream_id != stream_id);
    }

    fn remember_reset(&mut self, stream_id: u32) {
        self.reset_streams.insert(stream_id);
        if self.reset_streams.len() > MAX_RESET_STREAMS {
            self.reset_streams.shift_remove_index(0);
        }
    }

    /// Feed a HEADERS or CONTINUATION frame into the header block being assembled.
    ///
    /// Returns the decoded header list once the block is complete.
    fn accumulate_headers(&mut self, frame: Frame) -> Result<Option<(u32, Headers, bool)>> {
        let (stream_id, fragment, end_headers) = match frame {
            Frame::Headers {
                stream_id,
                header_block,
                end_stream,
                end_headers,
                ..
            } => {
                if self.is_peer_initiated(stream_id) && stream_id > self.highest_peer_stream_id {
                    self.highest_peer_stream_id = stream_id;
                }
                self.open_stream(stream_id);
                self.header_block = Some(HeaderBlock {
                    stream_id,
                    buf: BytesMut::new(),
                    end_stream,
                });
                (stream_id, header_block, end_headers)
            }
            Frame::Continuation {
                stream_id,
                header_block,
                end_headers,
            } => {
                if self.header_block.is_none() {
                    return Err(Error::http2(
                        ErrorCode::ProtocolError,
                        format!("unexpected CONTINUATION on stream {}", stream_id),
                    ));
                }
                (stream_id, header_block, end_headers)
            }
            other => {
                return Err(Error::internal(format!(
                    "{} frame is not part of a header block",
                    other.kind()
                )))
            }
        };

        let Some(block) = self.header_block.as_mut() else {
            return Ok(None);
        };
        block.buf.extend_from_slice(&fragment);
        if block.buf.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(Error::http2(
                ErrorCode::EnhanceYourCalm,
                format!("header block on stream {} too large", stream_id),
            ));
        }
        if !end_headers {
            return Ok(None);
        }

        let Some(block) = self.header_block.take() else {
            return Ok(None);
        };
        let mut fields = Vec::new();
        self.decoder
            .decode_with_cb(&block.buf, |name, value| {
                fields.push((name.into_owned(), value.into_owned()))
            })
            .map_err(|e| {
                Error::http2(
                    ErrorCode::CompressionError,
                    format!("HPACK decoding failed: {:?}", e),
                )
            })?;
        Ok(Some((block.stream_id, Headers::from_fields(fields), block.end_stream)))
    }

    fn is_peer_initiated(&self, stream_id: u32) -> bool {
        match self.role {
            Role::Server => stream_id % 2 == 1,
            Role::Client => stream_id % 2 == 0,
        }
    }

    /// Send a WINDOW_UPDATE for the connection and the stream for consumed DATA.
    fn replenish(&mut self, stream_id: u32, consumed: usize, stream_too: bool) -> Result<()> {
        if consumed == 0 {
            return Ok(());
        }
        let increment = consumed as u32;
        self.queue(Frame::window_update(0, increment))?;
        if stream_too {
            self.queue(Frame::window_update(stream_id, increment))?;
        }
        Ok(())
    }

    /// Apply a frame to the connection state and report what happened.
    ///
    /// Settings are acknowledged, pings answered and received data replenished
    /// automatically; anything written is flushed before returning.
    pub async fn process_frame(&mut self, frame: Frame) -> Result<Vec<H2Event>> {
        let mut events = Vec::new();
        match frame {
            Frame::Settings { ack: true, .. } => {}
            Frame::Settings {
                ack: false,
                settings,
            } => {
                self.apply_peer_settings(&settings)?;
                self.flush_pending()?;
                events.push(H2Event::SettingsChanged);
            }
            Frame::Ping {
                ack: false,
                payload,
            } => {
                self.queue(Frame::Ping { ack: true, payload })?;
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                self.apply_window_update(stream_id, increment)?;
                self.flush_pending()?;
                events.push(H2Event::WindowUpdated { stream_id });
            }
            frame @ (Frame::Headers { .. } | Frame::Continuation { .. }) => {
                if let Some((stream_id, headers, end_stream)) = self.accumulate_headers(frame)? {
                    if self.reset_streams.contains(&stream_id) {
                        trace!(stream_id, "dropping headers for reset stream");
                    } else {
                        events.push(H2Event::HeadersReceived {
                            stream_id,
                            headers,
                            end_stream,
                        });
                    }
                }
            }
            frame @ Frame::Data { .. } => {
                let consumed = frame.flow_controlled_length();
                let Frame::Data {
                    stream_id,
                    data,
                    end_stream,
                    ..
                } = frame
                else {
                    return Ok(events);
                };
                if self.reset_streams.contains(&stream_id) {
                    self.replenish(stream_id, consumed, false)?;
                } else {
                    self.replenish(stream_id, consumed, true)?;
                    events.push(H2Event::DataReceived {
                        stream_id,
                        data,
                        end_stream,
                    });
                }
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                self.forget_stream(stream_id);
                self.remember_reset(stream_id);
                events.push(H2Event::StreamReset {
                    stream_id,
                    error_code,
                });
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                debug!(
                    %error_code,
                    last_stream_id,
                    debug = %String::from_utf8_lossy(&debug_data),
                    "peer sent GOAWAY"
                );
                self.state = ConnectionState::Closed;
                events.push(H2Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                });
            }
            Frame::PushPromise { stream_id, .. } => {
                return Err(Error::http2(
                    ErrorCode::ProtocolError,
                    format!("PUSH_PROMISE on stream {} although push is disabled", stream_id),
                ));
            }
            Frame::Priority { .. } => {}
            Frame::Unknown { frame_type, .. } => {
                trace!(frame_type, "ignoring frame of unknown type");
            }
        }
        self.writer.flush().await?;
        Ok(events)
    }

    fn apply_window_update(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        if stream_id == 0 {
            self.conn_send_window += increment as i64;
            if self.conn_send_window > MAX_WINDOW_SIZE as i64 {
                return Err(Error::http2(
                    ErrorCode::FlowControlError,
                    "connection window exceeds 2^31-1",
                ));
            }
        } else if let Some(window) = self.stream_send_windows.get_mut(&stream_id) {
            *window += increment as i64;
            if *window > MAX_WINDOW_SIZE as i64 {
                return Err(Error::http2_stream(
                    ErrorCode::FlowControlError,
                    stream_id,
                    "stream window exceeds 2^31-1",
                ));
            }
        }
        Ok(())
    }

    /// HPACK-encode `headers` and send them, split into HEADERS and CONTINUATION
    /// frames according to the peer's maximum frame size.
    pub async fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &Headers,
        end_stream: bool,
    ) -> Result<()> {
        self.open_stream(stream_id);
        let block = self.encoder.encode(headers.iter());
        let max = self.peer_settings.max_frame_size as usize;
        for frame in split_header_block(stream_id, Bytes::from(block), end_stream, max) {
            self.queue(frame)?;
        }
        if end_stream {
            self.stream_send_windows.remove(&stream_id);
        }
        self.writer.flush().await
    }

    /// Send a body, respecting the peer's flow-control windows.
    ///
    /// Data that does not fit yet is queued and sent as WINDOW_UPDATEs arrive.
    pub async fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<()> {
        self.pending.push_back(PendingData {
            stream_id,
            data,
            end_stream,
        });
        self.flush_pending()?;
        self.writer.flush().await
    }

    pub fn has_pending_data(&self, stream_id: u32) -> bool {
        self.pending.iter().any(|p| p.stream_id == stream_id)
    }

    /// Write as much queued data as the windows allow, keeping per-stream order.
    fn flush_pending(&mut self) -> Result<()> {
        let mut blocked: HashSet<u32> = HashSet::new();
        let mut remaining = VecDeque::new();
        while let Some(mut item) = self.pending.pop_front() {
            if blocked.contains(&item.stream_id) {
                remaining.push_back(item);
                continue;
            }
            if self.write_data_frames(&mut item)? {
                if item.end_stream {
                    self.stream_send_windows.remove(&item.stream_id);
                }
            } else {
                blocked.insert(item.stream_id);
                remaining.push_back(item);
            }
        }
        self.pending = remaining;
        Ok(())
    }

    /// Returns whether `item` was written completely.
    fn write_data_frames(&mut self, item: &mut PendingData) -> Result<bool> {
        let max_frame = self.peer_settings.max_frame_size as i64;
        loop {
            if item.data.is_empty() {
                if item.end_stream {
                    self.queue(Frame::data(item.stream_id, Bytes::new(), true))?;
                }
                return Ok(true);
            }
            let stream_window = *self
                .stream_send_windows
                .entry(item.stream_id)
                .or_insert(self.peer_settings.initial_window_size as i64);
            let allowed = self.conn_send_window.min(stream_window).min(max_frame);
            if allowed <= 0 {
                trace!(stream_id = item.stream_id, "send window exhausted");
                return Ok(false);
            }
            let n = (allowed as usize).min(item.data.len());
            let chunk = item.data.split_to(n);
            let end_stream = item.end_stream && item.data.is_empty();
            self.conn_send_window -= n as i64;
            if let Some(window) = self.stream_send_windows.get_mut(&item.stream_id) {
                *window -= n as i64;
            }
            self.queue(Frame::data(item.stream_id, chunk, end_stream))?;
            if end_stream {
                return Ok(true);
            }
        }
    }

    pub async fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> Result<()> {
        debug!(stream_id, %error_code, "resetting stream");
        self.forget_stream(stream_id);
        self.remember_reset(stream_id);
        self.queue(Frame::rst_stream(stream_id, error_code))?;
        self.writer.flush().await
    }

    pub async fn send_goaway(&mut self, error_code: ErrorCode, debug_data: &[u8]) -> Result<()> {
        let last_stream_id = self.highest_peer_stream_id;
        self.queue(Frame::GoAway {
            last_stream_id,
            error_code,
            debug_data: Bytes::copy_from_slice(debug_data),
        })?;
        self.state = ConnectionState::Closed;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Read frames until the header block of `stream_id` (or of any stream
    /// when `None`) is complete.
    ///
    /// Returns the stream id, the decoded headers and whether a body follows.
    /// Every frame is processed as usual; events that belong elsewhere are
    /// handed to `unhandled`.
    pub async fn read_headers<F>(
        &mut self,
        stream_id: Option<u32>,
        mut unhandled: F,
    ) -> Result<(u32, Headers, bool)>
    where
        F: FnMut(H2Event),
    {
        loop {
            let frame = self.read_frame().await?;
            for event in self.process_frame(frame).await? {
                match event {
                    H2Event::HeadersReceived {
                        stream_id: id,
                        headers,
                        end_stream,
                    } if stream_id.map_or(true, |want| want == id) => {
                        return Ok((id, headers, !end_stream));
                    }
                    H2Event::StreamReset {
                        stream_id: id,
                        error_code,
                    } if stream_id == Some(id) => {
                        return Err(Error::http2_stream(error_code, id, "stream reset by peer"));
                    }
                    H2Event::ConnectionTerminated { error_code, .. } => {
                        return Err(Error::connection_closed(format!(
                            "peer sent GOAWAY ({}) while awaiting headers",
                            error_code
                        )));
                    }
                    other => unhandled(other),
                }
            }
        }
    }

    /// Read DATA frames of `stream_id` until END_STREAM and return the body.
    ///
    /// Trailers are accepted and dropped.
    pub async fn read_body<F>(&mut self, stream_id: u32, mut unhandled: F) -> Result<Bytes>
    where
        F: FnMut(H2Event),
    {
        let mut body = BytesMut::new();
        loop {
            let frame = self.read_frame().await?;
            for event in self.process_frame(frame).await? {
                match event {
                    H2Event::DataReceived {
                        stream_id: id,
                        data,
                        end_stream,
                    } if id == stream_id => {
                        body.extend_from_slice(&data);
                        if end_stream {
                            return Ok(body.freeze());
                        }
                    }
                    H2Event::HeadersReceived {
                        stream_id: id,
                        headers,
                        end_stream,
                    } if id == stream_id => {
                        debug!(stream_id, count = headers.len(), "dropping trailers");
                        if end_stream {
                            return Ok(body.freeze());
                        }
                    }
                    H2Event::StreamReset {
                        stream_id: id,
                        error_code,
                    } if id == stream_id => {
                        return Err(Error::http2_stream(error_code, id, "stream reset by peer"));
                    }
                    H2Event::ConnectionTerminated { error_code, .. } => {
                        return Err(Error::connection_closed(format!(
                            "peer sent GOAWAY ({}) before the body was complete",
                            error_code
                        )));
                    }
                    other => unhandled(other),
                }
            }
        }
    }

    /// Give back the underlying halves, e.g. to shut them down.
    pub fn into_parts(self) -> (Reader<R>, Writer<W>) {
        (self.reader, self.writer)
    }
}

/// Split an encoded header block into one HEADERS frame and as many
/// CONTINUATION frames as needed. Only the last frame carries END_HEADERS;
/// END_STREAM goes on the HEADERS frame.
pub fn split_header_block(
    stream_id: u32,
    mut block: Bytes,
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<Frame> {
    let max = max_frame_size.max(1);
    let first = block.split_to(block.len().min(max));
    let mut frames = vec![Frame::Headers {
        stream_id,
        header_block: first,
        end_stream,
        end_headers: block.is_empty(),
        priority: None,
        pad_length: None,
    }];
    while !block.is_empty() {
        let chunk = block.split_to(block.len().min(max));
        frames.push(Frame::Continuation {
            stream_id,
            header_block: chunk,
            end_headers: block.is_empty(),
        });
    }
    frames
}

impl<R, W> std::fmt::Debug for Http2Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_settings", &self.peer_settings)
            .field("conn_send_window", &self.conn_send_window)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::frame::{SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_FRAME_SIZE};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type Conn = Http2Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn conn(role: Role, io: DuplexStream) -> Conn {
        let (r, w) = split(io);
        let settings = Http2Settings {
            enable_push: false,
            ..Http2Settings::default()
        };
        Http2Connection::new(role, Reader::new(r), Writer::new(w), settings)
    }

    async fn connected_pair() -> (Conn, Conn) {
        let (a, b) = duplex(1 << 20);
        let mut client = conn(Role::Client, a);
        let mut server = conn(Role::Server, b);
        let (c, s) = tokio::join!(client.perform_client_preface(), async {
            server.perform_server_preface().await?;
            // The client waits for the ack of its settings.
            server.flush().await
        });
        c.unwrap();
        s.unwrap();
        // Acknowledgement of the server's settings.
        assert_eq!(server.read_frame().await.unwrap(), Frame::settings_ack());
        (client, server)
    }

    fn request_headers() -> Headers {
        Headers::from_iter([
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/"),
        ])
    }

    #[tokio::test]
    async fn test_preface_and_states() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(server.state(), ConnectionState::Active);
        assert!(!server.peer_settings().enable_push);
    }

    #[tokio::test]
    async fn test_server_rejects_bad_preface() {
        let (mut a, b) = duplex(1024);
        let mut server = conn(Role::Server, b);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"GET / HTTP/1.1\r\n\r\nxxxxxx")
            .await
            .unwrap();
        let err = server.perform_server_preface().await.unwrap_err();
        assert!(matches!(err, Error::Http2 { code: ErrorCode::ProtocolError, .. }));
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_stream_id_allocation() {
        let (a, b) = duplex(64);
        let mut client = conn(Role::Client, a);
        let mut server = conn(Role::Server, b);
        let client_ids: Vec<u32> = (0..3).map(|_| client.next_stream_id()).collect();
        let server_ids: Vec<u32> = (0..3).map(|_| server.next_stream_id()).collect();
        assert_eq!(client_ids, vec![1, 3, 5]);
        assert_eq!(server_ids, vec![2, 4, 6]);
    }

    #[test]
    fn test_split_header_block() {
        let block = Bytes::from(vec![7u8; 25]);
        let frames = split_header_block(1, block, true, 10);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            frames[0],
            Frame::Headers { end_stream: true, end_headers: false, .. }
        ));
        assert!(matches!(frames[1], Frame::Continuation { end_headers: false, .. }));
        assert!(matches!(frames[2], Frame::Continuation { end_headers: true, .. }));

        let frames = split_header_block(1, Bytes::from_static(b"ab"), false, 10);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Headers { end_headers: true, end_stream: false, .. }));
    }

    #[tokio::test]
    async fn test_split_headers_decode_identically() {
        let mut headers = request_headers();
        headers.append("x-big", "v".repeat(40_000));
        headers.append("set-cookie", "a=1");
        headers.append("set-cookie", "b=2");

        let (mut client, mut server) = connected_pair().await;
        let stream_id = client.next_stream_id();
        client.send_headers(stream_id, &headers, true).await.unwrap();

        let (id, received, body_expected) = server
            .read_headers(None, |f| panic!("unexpected {:?}", f))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert!(!body_expected);
        assert_eq!(received, headers);
    }

    #[tokio::test]
    async fn test_body_and_window_updates() {
        let (mut client, mut server) = connected_pair().await;
        let stream_id = client.next_stream_id();
        let body = Bytes::from(vec![b'x'; 40_000]);
        client.send_headers(stream_id, &request_headers(), false).await.unwrap();
        client.send_data(stream_id, body.clone(), true).await.unwrap();

        let (_, _, body_expected) = server.read_headers(Some(stream_id), |_| {}).await.unwrap();
        assert!(body_expected);
        let received = server.read_body(stream_id, |_| {}).await.unwrap();
        assert_eq!(received, body);

        // The client sees WINDOW_UPDATEs for stream 0 and stream 1.
        let mut connection_updates = 0;
        let mut stream_updates = 0;
        while connection_updates < 3 || stream_updates < 3 {
            match client.read_frame().await.unwrap() {
                Frame::WindowUpdate { stream_id: 0, .. } => connection_updates += 1,
                Frame::WindowUpdate { stream_id: 1, .. } => stream_updates += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_waits_for_window() {
        let (mut client, mut server) = connected_pair().await;
        // Shrink the client's view of the stream window.
        client
            .process_frame(Frame::settings(vec![(SETTINGS_INITIAL_WINDOW_SIZE, 10)]))
            .await
            .unwrap();
        let stream_id = client.next_stream_id();
        client.send_headers(stream_id, &request_headers(), false).await.unwrap();
        client
            .send_data(stream_id, Bytes::from_static(b"0123456789abcdef"), true)
            .await
            .unwrap();
        assert!(client.has_pending_data(stream_id));

        client
            .process_frame(Frame::window_update(stream_id, 100))
            .await
            .unwrap();
        assert!(!client.has_pending_data(stream_id));

        // Settings ack, then the request.
        let (_, _, body_expected) = server.read_headers(Some(stream_id), |_| {}).await.unwrap();
        assert!(body_expected);
        assert_eq!(
            server.read_body(stream_id, |_| {}).await.unwrap(),
            Bytes::from_static(b"0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_ping_answered_transparently() {
        let (mut client, mut server) = connected_pair().await;
        let events = server
            .process_frame(Frame::Ping {
                ack: false,
                payload: *b"12345678",
            })
            .await
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(
            client.read_frame().await.unwrap(),
            Frame::Ping {
                ack: true,
                payload: *b"12345678"
            }
        );
    }

    #[tokio::test]
    async fn test_settings_acked_and_applied() {
        let (mut client, mut server) = connected_pair().await;
        let events = server
            .process_frame(Frame::settings(vec![(SETTINGS_MAX_FRAME_SIZE, 20_000)]))
            .await
            .unwrap();
        assert_eq!(events, vec![H2Event::SettingsChanged]);
        assert_eq!(server.peer_settings().max_frame_size, 20_000);
        assert_eq!(client.read_frame().await.unwrap(), Frame::settings_ack());
    }

    #[tokio::test]
    async fn test_unhandled_frames_routed_to_callback() {
        let (mut client, mut server) = connected_pair().await;
        client.queue(Frame::data(3, Bytes::from_static(b"early"), false)).unwrap();
        client.send_headers(1, &request_headers(), true).await.unwrap();

        let mut unhandled = Vec::new();
        let (id, _, _) = server
            .read_headers(Some(1), |e| unhandled.push(e))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            unhandled,
            vec![H2Event::DataReceived {
                stream_id: 3,
                data: Bytes::from_static(b"early"),
                end_stream: false
            }]
        );
    }

    #[tokio::test]
    async fn test_continuation_must_follow_headers() {
        let (mut client, mut server) = connected_pair().await;
        client
            .queue(Frame::Headers {
                stream_id: 1,
                header_block: Bytes::from_static(b"\x82"),
                end_stream: true,
                end_headers: false,
                priority: None,
                pad_length: None,
            })
            .unwrap();
        client.queue(Frame::data(1, Bytes::from_static(b"x"), true)).unwrap();
        client.flush().await.unwrap();

        let first = server.read_frame().await.unwrap();
        assert!(server.process_frame(first).await.unwrap().is_empty());
        assert!(server.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_reset_stream_reported() {
        let (mut client, mut server) = connected_pair().await;
        client.reset_stream(1, ErrorCode::Cancel).await.unwrap();
        let frame = server.read_frame().await.unwrap();
        let events = server.process_frame(frame).await.unwrap();
        assert_eq!(
            events,
            vec![H2Event::StreamReset {
                stream_id: 1,
                error_code: ErrorCode::Cancel
            }]
        );
    }

    #[tokio::test]
    async fn test_malformed_header_block_is_compression_error() {
        let (_client, mut server) = connected_pair().await;
        // Dynamic table size update whose integer never terminates.
        let frame = Frame::Headers {
            stream_id: 1,
            header_block: Bytes::from_static(&[63, 205, 216, 198]),
            end_stream: true,
            end_headers: true,
            priority: None,
            pad_length: None,
        };
        let err = server.process_frame(frame).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Http2 {
                code: ErrorCode::CompressionError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reset_stream_memory_is_bounded() {
        let (a, _b) = duplex(64);
        let mut server = conn(Role::Server, a);
        for stream_id in (1..).step_by(2).take(MAX_RESET_STREAMS + 10) {
            server.remember_reset(stream_id);
        }
        assert_eq!(server.reset_streams.len(), MAX_RESET_STREAMS);
        assert!(!server.reset_streams.contains(&1));
        assert!(server.reset_streams.contains(&(2 * (MAX_RESET_STREAMS as u32 + 10) - 1)));
    }
}
