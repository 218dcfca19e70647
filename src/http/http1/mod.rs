//! HTTP/1.x codec: message reading and serialization.

pub mod assemble;
pub mod read;

pub use assemble::{
    assemble_request, assemble_request_head, assemble_response, assemble_response_head,
    chunk_encode,
};
pub use read::{
    connection_close, expect_continue, expected_http_body_size, read_body, read_request,
    read_request_body, read_request_head, read_response, read_response_body, read_response_head,
    BodySize, ReadOptions,
};
