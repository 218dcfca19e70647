use serde::{Deserialize, Serialize};

use super::headers::Headers;
use super::message::{Content, Message, MessageCore};
use crate::utils::now;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    pub core: MessageCore,
    pub status_code: u16,
    /// Empty for HTTP/2.
    pub reason: String,
}

impl Message for Response {
    fn core(&self) -> &MessageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessageCore {
        &mut self.core
    }
}

pub fn reason_phrase(status_code: u16) -> &'static str {
    http::StatusCode::from_u16(status_code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

impl Response {
    pub fn new(http_version: &str, status_code: u16, reason: &str, headers: Headers) -> Self {
        Self {
            core: MessageCore::new(http_version, headers, Content::Absent),
            status_code,
            reason: reason.to_string(),
        }
    }

    /// Build a complete HTTP/1.1 response, e.g. for a crafted reply.
    pub fn make(status_code: u16, body: impl Into<Vec<u8>>, headers: Headers) -> Self {
        let mut response = Self::new(
            "HTTP/1.1",
            status_code,
            reason_phrase(status_code),
            headers,
        );
        response.set_content(body.into());
        let ts = now();
        response.core.timestamp_start = Some(ts);
        response.core.timestamp_end = Some(ts);
        response
    }

    /// HTML error page sent when the proxy cannot deliver a response.
    pub fn error(status_code: u16, message: &str) -> Self {
        let headers = Headers::from_iter([
            ("Server", "mitmproxy-rs"),
            ("Connection", "close"),
            ("Content-Type", "text/html"),
        ]);
        Self::make(status_code, format_error(status_code, message), headers)
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_upgrade(&self) -> bool {
        self.status_code == 101
    }
}

pub fn format_error(status_code: u16, message: &str) -> Vec<u8> {
    let reason = reason_phrase(status_code);
    let message = message
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    format!(
        r#"<html>
<head>
    <title>{} {}</title>
</head>
<body>
    <h1>{} {}</h1>
    <p>{}</p>
</body>
</html>"#,
        status_code, reason, status_code, reason, message
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_sets_length_and_reason() {
        let response = Response::make(404, b"nope".to_vec(), Headers::new());
        assert_eq!(response.reason, "Not Found");
        assert_eq!(response.core.headers.get("content-length").as_deref(), Some("4"));
        assert_eq!(response.content().unwrap(), b"nope");
    }

    #[test]
    fn test_error_page_escapes_message() {
        let response = Response::error(502, "<script>");
        let body = String::from_utf8(response.content().unwrap().to_vec()).unwrap();
        assert!(body.contains("502 Bad Gateway"));
        assert!(body.contains("&lt;script&gt;"));
        assert_eq!(response.core.headers.get("connection").as_deref(), Some("close"));
    }

    #[test]
    fn test_reason_phrase_unknown() {
        assert_eq!(reason_phrase(799), "Unknown");
        assert_eq!(reason_phrase(204), "No Content");
    }
}
