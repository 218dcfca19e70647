//! Mapping between HTTP/2 header lists and the version-neutral message model.

use super::frame::ErrorCode;
use crate::http::headers::Headers;
use crate::http::message::{Content, MessageCore};
use crate::http::request::{FirstLineFormat, Request};
use crate::http::response::{reason_phrase, Response};
use crate::utils::{default_port, hostport, parse_authority};
use crate::{Error, Result};

pub const HTTP2_VERSION: &str = "HTTP/2.0";

/// Headers that have no meaning on an HTTP/2 connection.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

fn split_pseudo(headers: Headers) -> (Vec<(String, String)>, Headers) {
    let mut pseudo = Vec::new();
    let mut regular = Headers::new();
    for (name, value) in headers.into_fields() {
        if name.first() == Some(&b':') {
            pseudo.push((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        } else {
            regular.append(name, value);
        }
    }
    (pseudo, regular)
}

fn take_pseudo(pseudo: &[(String, String)], name: &str) -> Option<String> {
    pseudo
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

/// Build a request from a decoded request header list.
pub fn request_from_h2(stream_id: u32, headers: Headers) -> Result<Request> {
    let (pseudo, mut regular) = split_pseudo(headers);
    let method = take_pseudo(&pseudo, ":method").unwrap_or_else(|| "GET".to_string());
    let scheme = take_pseudo(&pseudo, ":scheme").unwrap_or_else(|| "https".to_string());
    let authority = take_pseudo(&pseudo, ":authority")
        .or_else(|| take_pseudo(&pseudo, ":host"))
        .or_else(|| regular.get("host"))
        .unwrap_or_else(|| "localhost".to_string());
    let path = take_pseudo(&pseudo, ":path").unwrap_or_else(|| "/".to_string());

    let (host, port) = parse_authority(&authority, false).map_err(|e| {
        Error::http2_stream(
            ErrorCode::ProtocolError,
            stream_id,
            format!("invalid :authority: {}", e),
        )
    })?;

    let cookies: Vec<Vec<u8>> = regular.get_all("cookie").iter().map(|c| c.to_vec()).collect();
    if cookies.len() > 1 {
        regular.set("Cookie", cookies.join(&b"; "[..]));
    }

    let is_connect = method.eq_ignore_ascii_case("CONNECT");
    Ok(Request {
        core: MessageCore::new(HTTP2_VERSION, regular, Content::Absent),
        port: Some(port.unwrap_or_else(|| default_port(&scheme))),
        scheme: (!is_connect).then_some(scheme),
        host: Some(host),
        path: (!is_connect).then_some(path),
        first_line_format: if is_connect {
            FirstLineFormat::Authority
        } else {
            FirstLineFormat::Relative
        },
        method,
    })
}

/// Build a response from a decoded response header list.
///
/// A missing `:status` yields 502.
pub fn response_from_h2(stream_id: u32, headers: Headers) -> Result<Response> {
    let (pseudo, regular) = split_pseudo(headers);
    let status_code = match take_pseudo(&pseudo, ":status") {
        Some(status) => status.trim().parse::<u16>().map_err(|_| {
            Error::http2_stream(
                ErrorCode::ProtocolError,
                stream_id,
                format!("invalid :status {:?}", status),
            )
        })?,
        None => 502,
    };
    Ok(Response {
        core: MessageCore::new(HTTP2_VERSION, regular, Content::Absent),
        status_code,
        reason: String::new(),
    })
}

fn strip_connection_specific(headers: &Headers) -> Headers {
    // Headers named in Connection are hop-by-hop as well.
    let mut nominated = headers.tokens("connection");
    nominated.extend(CONNECTION_SPECIFIC.iter().map(|s| s.to_string()));
    headers
        .iter()
        .filter(|(name, value)| {
            let name = String::from_utf8_lossy(name).to_ascii_lowercase();
            if name == "te" {
                return value.eq_ignore_ascii_case(b"trailers");
            }
            !nominated.contains(&name) && name != "host"
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_vec()))
        .collect()
}

/// Header list for sending `request` over HTTP/2: pseudo-headers first, lower-case
/// names and no connection-specific fields.
pub fn request_to_h2(request: &Request) -> Headers {
    let mut out = Headers::new();
    out.append(":method", &request.method);
    let authority = request
        .core
        .headers
        .get("host")
        .or_else(|| {
            request
                .host
                .as_ref()
                .map(|h| hostport(request.scheme_or_default(), h, request.port_or_default()))
        })
        .unwrap_or_default();

    if request.is_connect() {
        out.append(":authority", authority);
    } else {
        out.append(":scheme", request.scheme.as_deref().unwrap_or("https"));
        if !authority.is_empty() {
            out.append(":authority", authority);
        }
        out.append(":path", request.path.as_deref().unwrap_or("/"));
    }
    for (name, value) in strip_connection_specific(&request.core.headers).into_fields() {
        out.append(name, value);
    }
    out
}

pub fn response_to_h2(response: &Response) -> Headers {
    let mut out = Headers::new();
    out.append(":status", response.status_code.to_string());
    for (name, value) in strip_connection_specific(&response.core.headers).into_fields() {
        out.append(name, value);
    }
    out
}

/// Make an HTTP/2 request presentable to an HTTP/1.1 server.
pub fn request_to_http1(request: &mut Request) {
    if request.core.http_version != HTTP2_VERSION {
        return;
    }
    request.core.http_version = "HTTP/1.1".to_string();
    if !request.core.headers.contains("host") {
        if let Some(host) = &request.host {
            let value = hostport(request.scheme_or_default(), host, request.port_or_default());
            request.core.headers.insert(0, "Host", value);
        }
    }
}

/// Make an HTTP/2 response presentable to an HTTP/1.1 client.
pub fn response_to_http1(response: &mut Response) {
    if response.core.http_version != HTTP2_VERSION {
        return;
    }
    response.core.http_version = "HTTP/1.1".to_string();
    if response.reason.is_empty() {
        response.reason = reason_phrase(response.status_code).to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = request_from_h2(1, Headers::new()).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.scheme.as_deref(), Some("https"));
        assert_eq!(request.host.as_deref(), Some("localhost"));
        assert_eq!(request.port, Some(443));
        assert_eq!(request.path.as_deref(), Some("/"));
        assert_eq!(request.core.http_version, "HTTP/2.0");
    }

    #[test]
    fn test_request_from_pseudo_headers() {
        let headers = Headers::from_iter([
            (":method", "POST"),
            (":scheme", "http"),
            (":authority", "example.com:8080"),
            (":path", "/upload?x=1"),
            ("cookie", "a=1"),
            ("cookie", "b=2"),
            ("content-type", "text/plain"),
        ]);
        let request = request_from_h2(3, headers).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.port, Some(8080));
        assert_eq!(request.url(), "http://example.com:8080/upload?x=1");
        assert_eq!(request.core.headers.get_all("cookie"), vec![&b"a=1; b=2"[..]]);
        assert!(request.core.headers.iter().all(|(n, _)| !n.starts_with(b":")));
    }

    #[test]
    fn test_response_status_default() {
        let response = response_from_h2(1, Headers::from_iter([("server", "x")])).unwrap();
        assert_eq!(response.status_code, 502);
        assert_eq!(response.reason, "");

        let response = response_from_h2(1, Headers::from_iter([(":status", "204")])).unwrap();
        assert_eq!(response.status_code, 204);

        let err = response_from_h2(5, Headers::from_iter([(":status", "abc")])).unwrap_err();
        assert!(err.is_http2_stream_error());
    }

    #[test]
    fn test_request_to_h2_strips_connection_headers() {
        let mut request = Request::relative("GET", "/index", "HTTP/1.1");
        request.core.headers = Headers::from_iter([
            ("Host", "example.com"),
            ("Connection", "keep-alive, X-Hop"),
            ("X-Hop", "1"),
            ("Keep-Alive", "timeout=5"),
            ("TE", "gzip"),
            ("Accept", "*/*"),
        ]);
        let headers = request_to_h2(&request);
        let names: Vec<&[u8]> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![&b":method"[..], b":scheme", b":authority", b":path", b"accept"]
        );
        assert_eq!(headers.get(":authority").as_deref(), Some("example.com"));
    }

    #[test]
    fn test_response_to_http1_fills_reason() {
        let mut response = response_from_h2(1, Headers::from_iter([(":status", "404")])).unwrap();
        response_to_http1(&mut response);
        assert_eq!(response.core.http_version, "HTTP/1.1");
        assert_eq!(response.reason, "Not Found");
    }

    #[test]
    fn test_request_to_http1_adds_host() {
        let headers = Headers::from_iter([(":authority", "example.com"), (":path", "/")]);
        let mut request = request_from_h2(1, headers).unwrap();
        request_to_http1(&mut request);
        assert_eq!(request.core.headers.get("host").as_deref(), Some("example.com"));
    }
}
