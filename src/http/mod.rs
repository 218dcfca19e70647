//! HTTP message model and wire codecs.

pub mod encoding;
pub mod headers;
pub mod http1;
pub mod http2;
pub mod message;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use message::{decoded, Content, Message, MessageCore};
pub use request::{FirstLineFormat, Request};
pub use response::Response;
