//! HTTP/2 framing, connection state and message conversion.

pub mod connection;
pub mod convert;
pub mod frame;

pub use connection::{split_header_block, ConnectionState, H2Event, Http2Connection, Role};
pub use convert::{
    request_from_h2, request_to_h2, request_to_http1, response_from_h2, response_to_h2,
    response_to_http1, HTTP2_VERSION,
};
pub use frame::{ErrorCode, Frame, Http2FrameCodec, Http2Settings, CONNECTION_PREFACE};
