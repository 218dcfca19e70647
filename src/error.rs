use std::fmt;

use crate::http::http2::ErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Bad HTTP preamble: {0}")]
    BadPreamble(String),

    #[error("Bad HTTP headers: {0}")]
    BadHeaders(String),

    #[error("Bad chunked encoding: {0}")]
    BadChunk(String),

    #[error("Body too large: {0}")]
    BodyTooLarge(String),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Cannot assemble flow with missing content")]
    CannotAssemble,

    #[error("HTTP/2 {code} error: {message}")]
    Http2 {
        code: ErrorCode,
        stream_id: Option<u32>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Flow record error: {0}")]
    Record(String),

    #[error("Connection killed.")]
    Killed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn connection_closed<T: fmt::Display>(msg: T) -> Self {
        Error::ConnectionClosed(msg.to_string())
    }

    pub fn bad_preamble<T: fmt::Display>(msg: T) -> Self {
        Error::BadPreamble(msg.to_string())
    }

    pub fn bad_headers<T: fmt::Display>(msg: T) -> Self {
        Error::BadHeaders(msg.to_string())
    }

    pub fn bad_chunk<T: fmt::Display>(msg: T) -> Self {
        Error::BadChunk(msg.to_string())
    }

    pub fn body_too_large<T: fmt::Display>(msg: T) -> Self {
        Error::BodyTooLarge(msg.to_string())
    }

    pub fn decoding<T: fmt::Display>(msg: T) -> Self {
        Error::Decoding(msg.to_string())
    }

    pub fn filter<T: fmt::Display>(msg: T) -> Self {
        Error::Filter(msg.to_string())
    }

    pub fn record<T: fmt::Display>(msg: T) -> Self {
        Error::Record(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Connection-level HTTP/2 error.
    pub fn http2<T: fmt::Display>(code: ErrorCode, msg: T) -> Self {
        Error::Http2 {
            code,
            stream_id: None,
            message: msg.to_string(),
        }
    }

    /// HTTP/2 error confined to a single stream.
    pub fn http2_stream<T: fmt::Display>(code: ErrorCode, stream_id: u32, msg: T) -> Self {
        Error::Http2 {
            code,
            stream_id: Some(stream_id),
            message: msg.to_string(),
        }
    }

    /// Stable name of the error kind, recorded on flow errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::ConnectionClosed(_) => "ConnectionClosed",
            Error::BadPreamble(_) => "BadPreamble",
            Error::BadHeaders(_) => "BadHeaders",
            Error::BadChunk(_) => "BadChunk",
            Error::BodyTooLarge(_) => "BodyTooLarge",
            Error::LineTooLong(_) => "LineTooLong",
            Error::Decoding(_) => "DecodingError",
            Error::CannotAssemble => "CannotAssemble",
            Error::Http2 { .. } => "Http2ProtocolError",
            Error::Config(_) => "Config",
            Error::Json(_) => "Json",
            Error::Regex(_) => "Regex",
            Error::Filter(_) => "Filter",
            Error::Record(_) => "Record",
            Error::Killed => "Killed",
            Error::Internal(_) => "Internal",
            Error::Other(_) => "Other",
        }
    }

    /// True for HTTP/2 errors that only affect one stream.
    pub fn is_http2_stream_error(&self) -> bool {
        matches!(self, Error::Http2 { stream_id: Some(_), .. })
    }

    /// Malformed data or policy violation coming off the wire.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::BadPreamble(_)
                | Error::BadHeaders(_)
                | Error::BadChunk(_)
                | Error::BodyTooLarge(_)
                | Error::LineTooLong(_)
                | Error::Http2 { .. }
        )
    }
}
