//! HTTP/1.x message parsing.

use regex::Regex;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::http::headers::{HeaderField, Headers};
use crate::http::message::{Content, MessageCore};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::stream::{Reader, Writer};
use crate::utils::{default_port, now, parse_authority};
use crate::{Error, Result};

/// Upper bound for the request/status line and each header line.
pub const MAX_LINE_SIZE: usize = 64 * 1024;
/// Upper bound for a chunk-size line.
pub const MAX_CHUNK_SIZE_LINE: usize = 128;
const MAX_HEADERS: usize = 256;

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    Known(u64),
    Chunked,
    UntilEof,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub body_size_limit: Option<usize>,
    /// Reject requests that carry both `Transfer-Encoding: chunked` and `Content-Length`.
    pub reject_ambiguous_framing: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            body_size_limit: None,
            reject_ambiguous_framing: true,
        }
    }
}

fn version_re() -> &'static Regex {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    VERSION_RE.get_or_init(|| Regex::new(r"^HTTP/\d\.\d$").expect("version regex is valid"))
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Read the first line of a message, tolerating one stray blank line before it.
async fn read_first_line<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<String> {
    let mut line = reader.read_line(MAX_LINE_SIZE).await?;
    if strip_eol(&line).is_empty() && !line.is_empty() {
        trace!("skipping blank line before preamble");
        line = reader.read_line(MAX_LINE_SIZE).await?;
    }
    if line.is_empty() {
        return Err(Error::connection_closed("no preamble received"));
    }
    String::from_utf8(strip_eol(&line).to_vec())
        .map_err(|_| Error::bad_preamble("preamble is not valid UTF-8"))
}

/// Read header lines up to and including the blank line that ends them.
pub async fn read_headers<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<Headers> {
    let mut fields: Vec<HeaderField> = Vec::new();
    loop {
        let raw = reader.read_line(MAX_LINE_SIZE).await?;
        if raw.is_empty() {
            return Err(Error::connection_closed("connection closed while reading headers"));
        }
        let line = strip_eol(&raw);
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            let Some((_, value)) = fields.last_mut() else {
                return Err(Error::bad_headers("continuation line without a header"));
            };
            value.extend_from_slice(b"\r\n ");
            value.extend_from_slice(trim(line));
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(Error::bad_headers(format!(
                "invalid header line: {:?}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::bad_headers(format!(
                "invalid header name: {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        if fields.len() >= MAX_HEADERS {
            return Err(Error::bad_headers("too many headers"));
        }
        fields.push((name.to_vec(), trim(&line[colon + 1..]).to_vec()));
    }
    Ok(Headers::from_fields(fields))
}

fn check_version(version: &str) -> Result<()> {
    if version_re().is_match(version) {
        Ok(())
    } else {
        Err(Error::bad_preamble(format!("invalid HTTP version: {:?}", version)))
    }
}

/// Parse a request line into an empty request.
pub fn parse_request_line(line: &str) -> Result<Request> {
    let parts: Vec<&str> = line.split(' ').collect();
    let &[method, target, version] = parts.as_slice() else {
        return Err(Error::bad_preamble(format!("bad request line: {:?}", line)));
    };
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::bad_preamble(format!("bad request method: {:?}", method)));
    }
    check_version(version)?;

    if target == "*" || target.starts_with('/') {
        return Ok(Request::relative(method, target, version));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_authority(target, true)
            .map_err(|e| Error::bad_preamble(format!("bad CONNECT target: {}", e)))?;
        let port = port.ok_or_else(|| {
            Error::bad_preamble(format!("CONNECT target without port: {:?}", target))
        })?;
        let mut request = Request::connect(&host, port, version);
        request.method = method.to_string();
        return Ok(request);
    }

    let (scheme, host, port, path) = parse_absolute_target(target)?;
    Ok(Request::absolute(method, &scheme, &host, port, &path, version))
}

/// Split `scheme://authority/path?query` into its parts.
fn parse_absolute_target(target: &str) -> Result<(String, String, u16, String)> {
    let (scheme, rest) = target
        .split_once("://")
        .ok_or_else(|| Error::bad_preamble(format!("bad request target: {:?}", target)))?;
    let scheme_char = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.');
    if scheme.is_empty() || !scheme.bytes().all(scheme_char) {
        return Err(Error::bad_preamble(format!("bad URL scheme: {:?}", scheme)));
    }
    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split);
    let path = match path {
        "" => "/".to_string(),
        p if p.starts_with('?') => format!("/{}", p),
        p => p.to_string(),
    };
    let (host, port) = parse_authority(authority, true)
        .map_err(|e| Error::bad_preamble(format!("bad request target: {}", e)))?;
    let scheme = scheme.to_ascii_lowercase();
    let port = port.unwrap_or_else(|| default_port(&scheme));
    Ok((scheme, host, port, path))
}

/// Parse a status line. A missing reason phrase is accepted as empty.
pub fn parse_response_line(line: &str) -> Result<Response> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();

    check_version(version)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::bad_preamble(format!("bad status code: {:?}", code)));
    }
    let status_code: u16 = code
        .parse()
        .map_err(|_| Error::bad_preamble(format!("bad status code: {:?}", code)))?;
    Ok(Response::new(version, status_code, reason, Headers::new()))
}

pub async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<Request> {
    let line = read_first_line(reader).await?;
    let mut request = parse_request_line(&line)?;
    request.core.headers = read_headers(reader).await?;
    request.core.timestamp_start = reader.first_byte_timestamp().or_else(|| Some(now()));
    Ok(request)
}

pub async fn read_response_head<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<Response> {
    let line = read_first_line(reader).await?;
    let mut response = parse_response_line(&line)?;
    response.core.headers = read_headers(reader).await?;
    response.core.timestamp_start = reader.first_byte_timestamp().or_else(|| Some(now()));
    Ok(response)
}

/// Read a complete request: preamble, headers and body.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    options: &ReadOptions,
) -> Result<Request> {
    let mut request = read_request_head(reader).await?;
    read_request_body(reader, &mut request, options).await?;
    Ok(request)
}

pub async fn read_request_body<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    request: &mut Request,
    options: &ReadOptions,
) -> Result<()> {
    let size = expected_http_body_size(request, None, options.reject_ambiguous_framing)?;
    let body = read_body(reader, size, options.body_size_limit).await?;
    finish(&mut request.core, body);
    Ok(())
}

/// Read a complete response to `request`.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    request: &Request,
    options: &ReadOptions,
) -> Result<Response> {
    let mut response = read_response_head(reader).await?;
    read_response_body(reader, request, &mut response, options).await?;
    Ok(response)
}

pub async fn read_response_body<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    request: &Request,
    response: &mut Response,
    options: &ReadOptions,
) -> Result<()> {
    let size = expected_http_body_size(request, Some(response), options.reject_ambiguous_framing)?;
    let body = read_body(reader, size, options.body_size_limit).await?;
    finish(&mut response.core, body);
    Ok(())
}

fn finish(core: &mut MessageCore, body: Vec<u8>) {
    core.content = Content::Data(body);
    core.timestamp_end = Some(now());
}

/// Determine how the body of a message is framed.
///
/// With `response` set, the response's framing is computed; otherwise the request's.
pub fn expected_http_body_size(
    request: &Request,
    response: Option<&Response>,
    reject_ambiguous_framing: bool,
) -> Result<BodySize> {
    let headers = match response {
        Some(response) => {
            let code = response.status_code;
            if request.is_head()
                || (request.is_connect() && (200..300).contains(&code))
                || code == 204
                || code == 304
                || (100..200).contains(&code)
            {
                return Ok(BodySize::Known(0));
            }
            &response.core.headers
        }
        None => &request.core.headers,
    };

    if headers.has_token("transfer-encoding", "chunked") {
        if response.is_none() && reject_ambiguous_framing && headers.contains("content-length") {
            return Err(Error::bad_headers(
                "request has both Transfer-Encoding and Content-Length",
            ));
        }
        return Ok(BodySize::Chunked);
    }

    if let Some(length) = content_length(headers) {
        return Ok(BodySize::Known(length));
    }

    if response.is_none() {
        Ok(BodySize::Known(0))
    } else {
        Ok(BodySize::UntilEof)
    }
}

/// `Content-Length` value; `None` when absent, malformed or conflicting.
pub fn content_length(headers: &Headers) -> Option<u64> {
    let values = headers.get_all("content-length");
    let mut length = None;
    for value in values {
        for part in String::from_utf8_lossy(value).split(',') {
            let parsed: u64 = part.trim().parse().ok()?;
            match length {
                Some(existing) if existing != parsed => return None,
                _ => length = Some(parsed),
            }
        }
    }
    length
}

pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    size: BodySize,
    limit: Option<usize>,
) -> Result<Vec<u8>> {
    match size {
        BodySize::Known(0) => Ok(Vec::new()),
        BodySize::Known(length) => {
            if let Some(limit) = limit {
                if length > limit as u64 {
                    return Err(Error::body_too_large(format!(
                        "content-length {} exceeds limit of {} bytes",
                        length, limit
                    )));
                }
            }
            let length = usize::try_from(length)
                .map_err(|_| Error::body_too_large(format!("content-length {}", length)))?;
            Ok(reader.read_exact(length).await?.to_vec())
        }
        BodySize::Chunked => read_chunked(reader, limit).await,
        BodySize::UntilEof => Ok(reader.read_to_end(limit).await?.to_vec()),
    }
}

/// Read a chunked body, discarding any trailer section.
pub async fn read_chunked<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    limit: Option<usize>,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = match reader.read_line(MAX_CHUNK_SIZE_LINE).await {
            Ok(line) => line,
            Err(Error::LineTooLong(_)) => {
                return Err(Error::bad_chunk("chunk size line too long"));
            }
            Err(e) => return Err(e),
        };
        if line.is_empty() {
            return Err(Error::connection_closed("connection closed inside chunked body"));
        }
        let size_field = strip_eol(&line);
        let size_field = size_field
            .split(|&b| b == b';')
            .next()
            .map(trim)
            .unwrap_or_default();
        let size = std::str::from_utf8(size_field)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                Error::bad_chunk(format!(
                    "invalid chunk size: {:?}",
                    String::from_utf8_lossy(size_field)
                ))
            })?;

        if size == 0 {
            skip_trailers(reader).await?;
            return Ok(body);
        }
        if let Some(limit) = limit {
            if body.len().saturating_add(size) > limit {
                return Err(Error::body_too_large(format!(
                    "chunked body exceeds limit of {} bytes",
                    limit
                )));
            }
        }
        body.extend_from_slice(&reader.read_exact(size).await?);
        let end = reader.read_exact(2).await?;
        if &end[..] != b"\r\n" {
            return Err(Error::bad_chunk("chunk data not followed by CRLF"));
        }
    }
}

async fn skip_trailers<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> Result<()> {
    loop {
        let line = reader.read_line(MAX_LINE_SIZE).await?;
        if strip_eol(&line).is_empty() {
            return Ok(());
        }
        trace!(trailer = %String::from_utf8_lossy(strip_eol(&line)), "dropping trailer");
    }
}

/// Whether the connection should be closed after this message.
pub fn connection_close(http_version: &str, headers: &Headers) -> bool {
    let tokens = headers.tokens("connection");
    if tokens.iter().any(|t| t == "close") {
        return true;
    }
    if tokens.iter().any(|t| t == "keep-alive") {
        return false;
    }
    http_version != "HTTP/1.1"
}

/// Answer `Expect: 100-continue` with an interim response and drop the header.
///
/// Returns whether an interim response was written.
pub async fn expect_continue<W: AsyncWrite + Unpin>(
    request: &mut Request,
    writer: &mut Writer<W>,
) -> Result<bool> {
    let expects = request
        .core
        .headers
        .get("expect")
        .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);
    if !expects || request.core.http_version != "HTTP/1.1" {
        return Ok(false);
    }
    debug!("answering Expect: 100-continue");
    writer.send(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    request.core.headers.remove("expect");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::http1::assemble::chunk_encode;
    use crate::http::message::Message;
    use crate::http::request::FirstLineFormat;

    fn reader(data: &[u8]) -> Reader<&[u8]> {
        Reader::new(data)
    }

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut request = Request::relative("POST", "/", "HTTP/1.1");
        request.core.headers = Headers::from_iter(headers.iter().copied());
        request
    }

    #[tokio::test]
    async fn test_read_relative_request() {
        let mut r = reader(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let request = read_request(&mut r, &ReadOptions::default()).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path.as_deref(), Some("/foo"));
        assert_eq!(request.first_line_format, FirstLineFormat::Relative);
        assert!(request.host.is_none());
        assert_eq!(request.content(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn test_read_connect_request() {
        let mut r = reader(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        let request = read_request(&mut r, &ReadOptions::default()).await.unwrap();
        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.port, Some(443));
        assert_eq!(request.first_line_format, FirstLineFormat::Authority);
        assert!(request.path.is_none());
    }

    #[test]
    fn test_connect_target_validation() {
        assert!(parse_request_line("CONNECT example.com HTTP/1.1").is_err());
        assert!(parse_request_line("CONNECT example.com:0 HTTP/1.1").is_err());
        assert!(parse_request_line("CONNECT exa mple.com:443 HTTP/1.1").is_err());
    }

    #[test]
    fn test_absolute_target() {
        let request = parse_request_line("GET http://example.com:8080?q=1 HTTP/1.1").unwrap();
        assert_eq!(request.first_line_format, FirstLineFormat::Absolute);
        assert_eq!(request.scheme.as_deref(), Some("http"));
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.port, Some(8080));
        assert_eq!(request.path.as_deref(), Some("/?q=1"));

        let request = parse_request_line("GET https://example.com/a/b HTTP/1.1").unwrap();
        assert_eq!(request.port, Some(443));
        assert_eq!(request.path.as_deref(), Some("/a/b"));
    }

    #[test]
    fn test_bad_preamble() {
        for line in [
            "GET / HTTP/1.1 extra",
            "GET /",
            "GET / FTP/1.1",
            "GET example.com HTTP/1.1",
        ] {
            assert!(
                matches!(parse_request_line(line), Err(Error::BadPreamble(_))),
                "{}",
                line
            );
        }
        assert!(matches!(parse_response_line("HTTP/1.1 2000 OK"), Err(Error::BadPreamble(_))));
        assert!(matches!(parse_response_line("HTTP/x 200 OK"), Err(Error::BadPreamble(_))));
    }

    #[test]
    fn test_response_without_reason() {
        let response = parse_response_line("HTTP/1.1 200").unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.reason, "");

        let response = parse_response_line("HTTP/1.0 404 Not Found").unwrap();
        assert_eq!(response.reason, "Not Found");
    }

    #[tokio::test]
    async fn test_skips_single_blank_line() {
        let mut r = reader(b"\r\nGET / HTTP/1.1\r\n\r\n");
        assert!(read_request_head(&mut r).await.is_ok());

        let mut r = reader(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n");
        assert!(read_request_head(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_before_preamble() {
        let mut r = reader(b"");
        assert!(matches!(
            read_request_head(&mut r).await,
            Err(Error::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_header_continuation_and_errors() {
        let mut r = reader(b"X-Long: first\r\n\tsecond\r\nHost: a\r\n\r\n");
        let headers = read_headers(&mut r).await.unwrap();
        assert_eq!(headers.get_first("x-long"), Some(&b"first\r\n second"[..]));
        assert_eq!(headers.len(), 2);

        let mut r = reader(b"no colon here\r\n\r\n");
        assert!(matches!(read_headers(&mut r).await, Err(Error::BadHeaders(_))));
    }

    #[test]
    fn test_body_size_precedence() {
        let head = Request::relative("HEAD", "/", "HTTP/1.1");
        let get = Request::relative("GET", "/", "HTTP/1.1");
        let connect = Request::connect("example.com", 443, "HTTP/1.1");

        let mut response = Response::new("HTTP/1.1", 200, "OK", Headers::from_iter([("Content-Length", "10")]));
        assert_eq!(expected_http_body_size(&head, Some(&response), true).unwrap(), BodySize::Known(0));
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::Known(10));
        assert_eq!(expected_http_body_size(&connect, Some(&response), true).unwrap(), BodySize::Known(0));

        response.status_code = 204;
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::Known(0));
        response.status_code = 101;
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::Known(0));

        let response = Response::new("HTTP/1.1", 200, "OK", Headers::new());
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::UntilEof);
        assert_eq!(expected_http_body_size(&get, None, true).unwrap(), BodySize::Known(0));

        let response = Response::new(
            "HTTP/1.1",
            200,
            "OK",
            Headers::from_iter([("Transfer-Encoding", "gzip, chunked"), ("Content-Length", "3")]),
        );
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::Chunked);
    }

    #[test]
    fn test_malformed_content_length_falls_through() {
        let get = Request::relative("GET", "/", "HTTP/1.1");
        for value in ["-1", "abc", "5, 6"] {
            let response = Response::new("HTTP/1.1", 200, "OK", Headers::from_iter([("Content-Length", value)]));
            assert_eq!(
                expected_http_body_size(&get, Some(&response), true).unwrap(),
                BodySize::UntilEof
            );
            assert_eq!(
                expected_http_body_size(&request_with(&[("Content-Length", value)]), None, true).unwrap(),
                BodySize::Known(0)
            );
        }
        let response = Response::new("HTTP/1.1", 200, "OK", Headers::from_iter([("Content-Length", "5, 5")]));
        assert_eq!(expected_http_body_size(&get, Some(&response), true).unwrap(), BodySize::Known(5));
    }

    #[test]
    fn test_ambiguous_request_framing() {
        let request = request_with(&[("Transfer-Encoding", "chunked"), ("Content-Length", "4")]);
        assert!(matches!(
            expected_http_body_size(&request, None, true),
            Err(Error::BadHeaders(_))
        ));
        assert_eq!(expected_http_body_size(&request, None, false).unwrap(), BodySize::Chunked);
    }

    #[tokio::test]
    async fn test_chunked_round_trip() {
        for body in [&b""[..], b"a", b"hello world", &[0u8, 13, 10, 255][..]] {
            let encoded = chunk_encode(body);
            let mut r = reader(&encoded);
            assert_eq!(read_chunked(&mut r, None).await.unwrap(), body);
        }
    }

    #[tokio::test]
    async fn test_chunked_with_extensions_and_trailers() {
        let mut r = reader(b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT");
        assert_eq!(read_chunked(&mut r, None).await.unwrap(), b"hello world");
        assert_eq!(r.buffered(), b"NEXT");
    }

    #[tokio::test]
    async fn test_chunked_errors() {
        let mut r = reader(b"zz\r\nhello\r\n0\r\n\r\n");
        assert!(matches!(read_chunked(&mut r, None).await, Err(Error::BadChunk(_))));

        let long = format!("{}\r\n", "0".repeat(200));
        let mut r = reader(long.as_bytes());
        assert!(matches!(read_chunked(&mut r, None).await, Err(Error::BadChunk(_))));

        let mut r = reader(b"a\r\nhel");
        assert!(matches!(read_chunked(&mut r, None).await, Err(Error::ConnectionClosed(_))));

        let mut r = reader(b"5\r\nhelloXX0\r\n\r\n");
        assert!(matches!(read_chunked(&mut r, None).await, Err(Error::BadChunk(_))));

        let mut r = reader(b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n");
        assert!(matches!(read_chunked(&mut r, Some(8)).await, Err(Error::BodyTooLarge(_))));
    }

    #[tokio::test]
    async fn test_body_limit_on_content_length() {
        let mut r = reader(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n");
        let options = ReadOptions {
            body_size_limit: Some(10),
            ..ReadOptions::default()
        };
        assert!(matches!(read_request(&mut r, &options).await, Err(Error::BodyTooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_response_until_eof() {
        let request = Request::relative("GET", "/", "HTTP/1.0");
        let mut r = reader(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nall of it");
        let response = read_response(&mut r, &request, &ReadOptions::default()).await.unwrap();
        assert_eq!(response.content(), Some(&b"all of it"[..]));
        assert!(response.core.timestamp_start.is_some());
        assert!(response.core.timestamp_end.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_sequence() {
        let mut r = reader(
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc\
              POST /b HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nde\r\n0\r\n\r\n",
        );
        let first = read_request(&mut r, &ReadOptions::default()).await.unwrap();
        let second = read_request(&mut r, &ReadOptions::default()).await.unwrap();
        assert_eq!(first.content(), Some(&b"abc"[..]));
        assert_eq!(second.path.as_deref(), Some("/b"));
        assert_eq!(second.content(), Some(&b"de"[..]));
    }

    #[test]
    fn test_connection_close() {
        let close = Headers::from_iter([("Connection", "Close")]);
        let keep = Headers::from_iter([("Connection", "keep-alive")]);
        let none = Headers::new();
        assert!(connection_close("HTTP/1.1", &close));
        assert!(!connection_close("HTTP/1.0", &keep));
        assert!(!connection_close("HTTP/1.1", &none));
        assert!(connection_close("HTTP/1.0", &none));
    }

    #[tokio::test]
    async fn test_expect_continue() {
        let mock = tokio_test::io::Builder::new()
            .write(b"HTTP/1.1 100 Continue\r\n\r\n")
            .build();
        let mut writer = Writer::new(mock);
        let mut request = request_with(&[("Expect", "100-continue"), ("Content-Length", "2")]);
        assert!(expect_continue(&mut request, &mut writer).await.unwrap());
        assert!(!request.core.headers.contains("expect"));

        let mut request = request_with(&[]);
        let mut writer = Writer::new(tokio_test::io::Builder::new().build());
        assert!(!expect_continue(&mut request, &mut writer).await.unwrap());
    }
}
