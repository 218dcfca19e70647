//! HTTP/2 frames (RFC 7540 section 4 and 6) and their `tokio_util` codec.
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//!  +-----------------------------------------------+
//!  |                 Length (24)                   |
//!  +---------------+---------------+---------------+
//!  |   Type (8)    |   Flags (8)   |
//!  +-+-------------+---------------+---------------+
//!  |R|                Stream Identifier (31)       |
//!  +-+---------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

pub const CONNECTION_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 error codes (RFC 7540 section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Unknown(code) => return write!(f, "UNKNOWN_{:#x}", code),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub depends_on: u32,
    pub weight: u8,
}

impl Priority {
    fn parse(buf: &[u8]) -> Self {
        Self {
            exclusive: buf[0] & 0x80 != 0,
            depends_on: u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]),
            weight: buf[4],
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let dep = if self.exclusive {
            self.depends_on | 0x8000_0000
        } else {
            self.depends_on & 0x7fff_ffff
        };
        dst.put_u32(dep);
        dst.put_u8(self.weight);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        pad_length: Option<u8>,
    },
    Headers {
        stream_id: u32,
        header_block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
        pad_length: Option<u8>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        header_block: Bytes,
        end_headers: bool,
        pad_length: Option<u8>,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        header_block: Bytes,
        end_headers: bool,
    },
    /// Frames of unknown type are passed through untouched.
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

/// Which stream ids a frame kind may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamAssociation {
    Connection,
    Stream,
    Either,
}

impl Frame {
    pub fn data(stream_id: u32, data: impl Into<Bytes>, end_stream: bool) -> Self {
        Frame::Data {
            stream_id,
            data: data.into(),
            end_stream,
            pad_length: None,
        }
    }

    pub fn settings(settings: Vec<(u16, u32)>) -> Self {
        Frame::Settings {
            ack: false,
            settings,
        }
    }

    pub fn settings_ack() -> Self {
        Frame::Settings {
            ack: true,
            settings: Vec::new(),
        }
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Frame::WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub fn rst_stream(stream_id: u32, error_code: ErrorCode) -> Self {
        Frame::RstStream {
            stream_id,
            error_code,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Data { .. } => FRAME_DATA,
            Frame::Headers { .. } => FRAME_HEADERS,
            Frame::Priority { .. } => FRAME_PRIORITY,
            Frame::RstStream { .. } => FRAME_RST_STREAM,
            Frame::Settings { .. } => FRAME_SETTINGS,
            Frame::PushPromise { .. } => FRAME_PUSH_PROMISE,
            Frame::Ping { .. } => FRAME_PING,
            Frame::GoAway { .. } => FRAME_GOAWAY,
            Frame::WindowUpdate { .. } => FRAME_WINDOW_UPDATE,
            Frame::Continuation { .. } => FRAME_CONTINUATION,
            Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn flags(&self) -> u8 {
        let bit = |set: bool, flag: u8| if set { flag } else { 0 };
        match self {
            Frame::Data {
                end_stream,
                pad_length,
                ..
            } => bit(*end_stream, FLAG_END_STREAM) | bit(pad_length.is_some(), FLAG_PADDED),
            Frame::Headers {
                end_stream,
                end_headers,
                priority,
                pad_length,
                ..
            } => {
                bit(*end_stream, FLAG_END_STREAM)
                    | bit(*end_headers, FLAG_END_HEADERS)
                    | bit(pad_length.is_some(), FLAG_PADDED)
                    | bit(priority.is_some(), FLAG_PRIORITY)
            }
            Frame::PushPromise {
                end_headers,
                pad_length,
                ..
            } => bit(*end_headers, FLAG_END_HEADERS) | bit(pad_length.is_some(), FLAG_PADDED),
            Frame::Continuation { end_headers, .. } => bit(*end_headers, FLAG_END_HEADERS),
            Frame::Settings { ack, .. } | Frame::Ping { ack, .. } => bit(*ack, FLAG_ACK),
            Frame::Unknown { flags, .. } => *flags,
            Frame::Priority { .. }
            | Frame::RstStream { .. }
            | Frame::GoAway { .. }
            | Frame::WindowUpdate { .. } => 0,
        }
    }

    pub fn is_end_stream(&self) -> bool {
        matches!(
            self,
            Frame::Data { end_stream: true, .. } | Frame::Headers { end_stream: true, .. }
        )
    }

    /// Bytes counted against flow-control windows: payload plus padding.
    pub fn flow_controlled_length(&self) -> usize {
        match self {
            Frame::Data {
                data, pad_length, ..
            } => data.len() + pad_length.map(|p| p as usize + 1).unwrap_or(0),
            _ => 0,
        }
    }

    fn association(frame_type: u8) -> StreamAssociation {
        match frame_type {
            FRAME_SETTINGS | FRAME_PING | FRAME_GOAWAY => StreamAssociation::Connection,
            FRAME_WINDOW_UPDATE => StreamAssociation::Either,
            FRAME_DATA | FRAME_HEADERS | FRAME_PRIORITY | FRAME_RST_STREAM
            | FRAME_PUSH_PROMISE | FRAME_CONTINUATION => StreamAssociation::Stream,
            _ => StreamAssociation::Either,
        }
    }

    /// Check the frame's stream id against the rule for its kind.
    pub fn validate_stream_association(&self) -> Result<()> {
        check_association(self.frame_type(), self.stream_id())
    }

    fn payload_len(&self) -> usize {
        let padding = |pad: &Option<u8>| pad.map(|p| p as usize + 1).unwrap_or(0);
        match self {
            Frame::Data {
                data, pad_length, ..
            } => data.len() + padding(pad_length),
            Frame::Headers {
                header_block,
                priority,
                pad_length,
                ..
            } => header_block.len() + padding(pad_length) + if priority.is_some() { 5 } else { 0 },
            Frame::Priority { .. } => 5,
            Frame::RstStream { .. } => 4,
            Frame::Settings { settings, .. } => settings.len() * 6,
            Frame::PushPromise {
                header_block,
                pad_length,
                ..
            } => 4 + header_block.len() + padding(pad_length),
            Frame::Ping { .. } => 8,
            Frame::GoAway { debug_data, .. } => 8 + debug_data.len(),
            Frame::WindowUpdate { .. } => 4,
            Frame::Continuation { header_block, .. } => header_block.len(),
            Frame::Unknown { payload, .. } => payload.len(),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload_len();
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_uint(len as u64, 3);
        dst.put_u8(self.frame_type());
        dst.put_u8(self.flags());
        dst.put_u32(self.stream_id() & 0x7fff_ffff);

        let put_padding = |dst: &mut BytesMut, pad: &Option<u8>| {
            if let Some(pad) = pad {
                dst.put_bytes(0, *pad as usize);
            }
        };

        match self {
            Frame::Data {
                data, pad_length, ..
            } => {
                if let Some(pad) = pad_length {
                    dst.put_u8(*pad);
                }
                dst.extend_from_slice(data);
                put_padding(dst, pad_length);
            }
            Frame::Headers {
                header_block,
                priority,
                pad_length,
                ..
            } => {
                if let Some(pad) = pad_length {
                    dst.put_u8(*pad);
                }
                if let Some(priority) = priority {
                    priority.encode(dst);
                }
                dst.extend_from_slice(header_block);
                put_padding(dst, pad_length);
            }
            Frame::Priority { priority, .. } => priority.encode(dst),
            Frame::RstStream { error_code, .. } => dst.put_u32(error_code.as_u32()),
            Frame::Settings { settings, .. } => {
                for (id, value) in settings {
                    dst.put_u16(*id);
                    dst.put_u32(*value);
                }
            }
            Frame::PushPromise {
                promised_stream_id,
                header_block,
                pad_length,
                ..
            } => {
                if let Some(pad) = pad_length {
                    dst.put_u8(*pad);
                }
                dst.put_u32(promised_stream_id & 0x7fff_ffff);
                dst.extend_from_slice(header_block);
                put_padding(dst, pad_length);
            }
            Frame::Ping { payload, .. } => dst.extend_from_slice(payload),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                dst.put_u32(last_stream_id & 0x7fff_ffff);
                dst.put_u32(error_code.as_u32());
                dst.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate { increment, .. } => dst.put_u32(increment & 0x7fff_ffff),
            Frame::Continuation { header_block, .. } => dst.extend_from_slice(header_block),
            Frame::Unknown { payload, .. } => dst.extend_from_slice(payload),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse a frame from its header fields and complete payload.
    pub fn parse(frame_type: u8, flags: u8, stream_id: u32, payload: Bytes) -> Result<Self> {
        check_association(frame_type, stream_id)?;

        let frame = match frame_type {
            FRAME_DATA => {
                let (data, pad_length) = strip_padding(payload, flags)?;
                Frame::Data {
                    stream_id,
                    data,
                    end_stream: flags & FLAG_END_STREAM != 0,
                    pad_length,
                }
            }
            FRAME_HEADERS => {
                let (mut block, pad_length) = strip_padding(payload, flags)?;
                let priority = if flags & FLAG_PRIORITY != 0 {
                    if block.len() < 5 {
                        return Err(Error::http2(
                            ErrorCode::FrameSizeError,
                            "HEADERS frame too short for priority",
                        ));
                    }
                    let priority = Priority::parse(&block[..5]);
                    block.advance(5);
                    Some(priority)
                } else {
                    None
                };
                Frame::Headers {
                    stream_id,
                    header_block: block,
                    end_stream: flags & FLAG_END_STREAM != 0,
                    end_headers: flags & FLAG_END_HEADERS != 0,
                    priority,
                    pad_length,
                }
            }
            FRAME_PRIORITY => {
                expect_len(&payload, 5, "PRIORITY")?;
                Frame::Priority {
                    stream_id,
                    priority: Priority::parse(&payload),
                }
            }
            FRAME_RST_STREAM => {
                expect_len(&payload, 4, "RST_STREAM")?;
                Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_u32(read_u32(&payload)),
                }
            }
            FRAME_SETTINGS => {
                let ack = flags & FLAG_ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(Error::http2(
                        ErrorCode::FrameSizeError,
                        "SETTINGS ack with a payload",
                    ));
                }
                if payload.len() % 6 != 0 {
                    return Err(Error::http2(
                        ErrorCode::FrameSizeError,
                        "SETTINGS payload is not a multiple of 6",
                    ));
                }
                let settings = payload
                    .chunks_exact(6)
                    .map(|c| (u16::from_be_bytes([c[0], c[1]]), read_u32(&c[2..])))
                    .collect();
                Frame::Settings { ack, settings }
            }
            FRAME_PUSH_PROMISE => {
                let (mut block, pad_length) = strip_padding(payload, flags)?;
                if block.len() < 4 {
                    return Err(Error::http2(
                        ErrorCode::FrameSizeError,
                        "PUSH_PROMISE frame too short",
                    ));
                }
                let promised_stream_id = read_u32(&block) & 0x7fff_ffff;
                block.advance(4);
                Frame::PushPromise {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: flags & FLAG_END_HEADERS != 0,
                    pad_length,
                }
            }
            FRAME_PING => {
                expect_len(&payload, 8, "PING")?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    ack: flags & FLAG_ACK != 0,
                    payload: data,
                }
            }
            FRAME_GOAWAY => {
                if payload.len() < 8 {
                    return Err(Error::http2(ErrorCode::FrameSizeError, "GOAWAY frame too short"));
                }
                Frame::GoAway {
                    last_stream_id: read_u32(&payload) & 0x7fff_ffff,
                    error_code: ErrorCode::from_u32(read_u32(&payload[4..])),
                    debug_data: payload.slice(8..),
                }
            }
            FRAME_WINDOW_UPDATE => {
                expect_len(&payload, 4, "WINDOW_UPDATE")?;
                let increment = read_u32(&payload) & 0x7fff_ffff;
                if increment == 0 {
                    let msg = "WINDOW_UPDATE with zero increment";
                    return Err(if stream_id == 0 {
                        Error::http2(ErrorCode::ProtocolError, msg)
                    } else {
                        Error::http2_stream(ErrorCode::ProtocolError, stream_id, msg)
                    });
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            FRAME_CONTINUATION => Frame::Continuation {
                stream_id,
                header_block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            },
            _ => Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            },
        };
        Ok(frame)
    }
}

fn check_association(frame_type: u8, stream_id: u32) -> Result<()> {
    match (Frame::association(frame_type), stream_id) {
        (StreamAssociation::Connection, id) if id != 0 => Err(Error::http2(
            ErrorCode::ProtocolError,
            format!("frame type {:#x} must use stream 0, got {}", frame_type, id),
        )),
        (StreamAssociation::Stream, 0) => Err(Error::http2(
            ErrorCode::ProtocolError,
            format!("frame type {:#x} must not use stream 0", frame_type),
        )),
        _ => Ok(()),
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn expect_len(payload: &[u8], len: usize, kind: &str) -> Result<()> {
    if payload.len() != len {
        return Err(Error::http2(
            ErrorCode::FrameSizeError,
            format!("{} payload must be {} bytes, got {}", kind, len, payload.len()),
        ));
    }
    Ok(())
}

fn strip_padding(mut payload: Bytes, flags: u8) -> Result<(Bytes, Option<u8>)> {
    if flags & FLAG_PADDED == 0 {
        return Ok((payload, None));
    }
    if payload.is_empty() {
        return Err(Error::http2(
            ErrorCode::FrameSizeError,
            "padded frame without pad length",
        ));
    }
    let pad = payload[0];
    payload.advance(1);
    if pad as usize > payload.len() {
        return Err(Error::http2(
            ErrorCode::ProtocolError,
            "padding exceeds frame payload",
        ));
    }
    payload.truncate(payload.len() - pad as usize);
    Ok((payload, Some(pad)))
}

/// Length-delimited HTTP/2 frame codec.
#[derive(Debug, Clone)]
pub struct Http2FrameCodec {
    max_frame_size: u32,
}

impl Http2FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest payload accepted from the peer, i.e. our advertised `SETTINGS_MAX_FRAME_SIZE`.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

impl Default for Http2FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Http2FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = ((src[0] as usize) << 16) | ((src[1] as usize) << 8) | src[2] as usize;
        let frame_type = src[3];
        let flags = src[4];
        let stream_id = read_u32(&src[5..9]) & 0x7fff_ffff;

        if length > self.max_frame_size as usize {
            return Err(Error::http2(
                ErrorCode::FrameSizeError,
                format!(
                    "frame of {} bytes exceeds maximum of {}",
                    length, self.max_frame_size
                ),
            ));
        }
        if src.len() < FRAME_HEADER_LEN + length {
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Frame::parse(frame_type, flags, stream_id, payload).map(Some)
    }
}

impl Encoder<Frame> for Http2FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode(dst);
        Ok(())
    }
}

/// Settings of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Http2Settings {
    /// Apply one received setting. Unknown identifiers are ignored.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<()> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => {
                    return Err(Error::http2(
                        ErrorCode::ProtocolError,
                        format!("invalid ENABLE_PUSH value {}", value),
                    ))
                }
            },
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(Error::http2(
                        ErrorCode::FlowControlError,
                        format!("initial window size {} too large", value),
                    ));
                }
                self.initial_window_size = value;
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                    return Err(Error::http2(
                        ErrorCode::ProtocolError,
                        format!("invalid max frame size {}", value),
                    ));
                }
                self.max_frame_size = value;
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            _ => {}
        }
        Ok(())
    }

    /// Settings that differ from the protocol defaults, in wire form.
    pub fn to_frame_settings(&self) -> Vec<(u16, u32)> {
        let defaults = Http2Settings::default();
        let mut settings = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            settings.push((SETTINGS_HEADER_TABLE_SIZE, self.header_table_size));
        }
        if self.enable_push != defaults.enable_push {
            settings.push((SETTINGS_ENABLE_PUSH, self.enable_push as u32));
        }
        if let Some(max) = self.max_concurrent_streams {
            settings.push((SETTINGS_MAX_CONCURRENT_STREAMS, max));
        }
        if self.initial_window_size != defaults.initial_window_size {
            settings.push((SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            settings.push((SETTINGS_MAX_FRAME_SIZE, self.max_frame_size));
        }
        if let Some(max) = self.max_header_list_size {
            settings.push((SETTINGS_MAX_HEADER_LIST_SIZE, max));
        }
        settings
    }
}
