//! HTTP/1.x message serialization.

use crate::http::headers::Headers;
use crate::http::message::Content;
use crate::http::request::{FirstLineFormat, Request};
use crate::http::response::Response;
use crate::utils::hostport;
use crate::{Error, Result};

const REQUEST_HOP_BY_HOP: &[&str] = &[
    "Proxy-Connection",
    "Keep-Alive",
    "Connection",
    "Transfer-Encoding",
    "Upgrade",
];

const RESPONSE_HOP_BY_HOP: &[&str] = &["Proxy-Connection", "Alternate-Protocol", "Alt-Svc"];

pub fn assemble_request(request: &Request) -> Result<Vec<u8>> {
    if request.core.content.is_missing() {
        return Err(Error::CannotAssemble);
    }
    let mut out = assemble_request_head(request)?;
    out.extend_from_slice(request.core.content.as_bytes().unwrap_or_default());
    Ok(out)
}

pub fn assemble_request_head(request: &Request) -> Result<Vec<u8>> {
    let mut out = format!(
        "{} {} {}\r\n",
        request.method,
        request.target(),
        request.core.http_version
    )
    .into_bytes();
    out.extend_from_slice(&request_headers(request).to_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

fn request_headers(request: &Request) -> Headers {
    let mut headers = request.core.headers.clone();
    let was_chunked = headers.has_token("transfer-encoding", "chunked");
    for name in REQUEST_HOP_BY_HOP {
        headers.remove(name);
    }

    if !headers.contains("host") && request.first_line_format != FirstLineFormat::Authority {
        if let (Some(host), Some(port)) = (&request.host, request.port) {
            let scheme = request.scheme.as_deref().unwrap_or("http");
            headers.insert(0, "Host", hostport(scheme, host, port));
        }
    }

    if let Content::Data(body) = &request.core.content {
        if !body.is_empty() || was_chunked || headers.contains("content-length") {
            headers.set("Content-Length", body.len().to_string());
        }
    }
    headers
}

pub fn assemble_response(response: &Response) -> Result<Vec<u8>> {
    if response.core.content.is_missing() {
        return Err(Error::CannotAssemble);
    }
    let mut out = assemble_response_head(response)?;
    out.extend_from_slice(response.core.content.as_bytes().unwrap_or_default());
    Ok(out)
}

pub fn assemble_response_head(response: &Response) -> Result<Vec<u8>> {
    let mut out = if response.reason.is_empty() {
        format!("{} {}\r\n", response.core.http_version, response.status_code)
    } else {
        format!(
            "{} {} {}\r\n",
            response.core.http_version, response.status_code, response.reason
        )
    }
    .into_bytes();
    out.extend_from_slice(&response_headers(response).to_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

fn response_headers(response: &Response) -> Headers {
    let mut headers = response.core.headers.clone();
    for name in RESPONSE_HOP_BY_HOP {
        headers.remove(name);
    }

    let no_body_status = response.is_informational()
        || response.status_code == 204
        || response.status_code == 304;
    let body = match &response.core.content {
        Content::Data(body) => Some(body.as_slice()),
        Content::Absent => Some(&[][..]),
        Content::Missing => None,
    };
    if let Some(body) = body {
        // The body is forwarded in one piece.
        headers.remove("Transfer-Encoding");
        if !body.is_empty() || (!no_body_status && !headers.contains("content-length")) {
            headers.set("Content-Length", body.len().to_string());
        }
    }
    headers
}

/// Encode `data` as a single chunk followed by the terminating chunk.
pub fn chunk_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if !data.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
