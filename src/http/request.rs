use serde::{Deserialize, Serialize};

use super::headers::Headers;
use super::message::{Content, Message, MessageCore};
use crate::utils::{default_port, hostport, parse_authority};

/// Request-target form (RFC 7230 section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstLineFormat {
    /// `/path` or `*`
    Relative,
    /// `http://host:port/path`
    Absolute,
    /// `host:port`, CONNECT only
    Authority,
}

impl FirstLineFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirstLineFormat::Relative => "relative",
            FirstLineFormat::Absolute => "absolute",
            FirstLineFormat::Authority => "authority",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relative" => Some(FirstLineFormat::Relative),
            "absolute" => Some(FirstLineFormat::Absolute),
            "authority" => Some(FirstLineFormat::Authority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub core: MessageCore,
    pub method: String,
    pub scheme: Option<String>,
    /// Connection target; not derived from the `Host` header.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub first_line_format: FirstLineFormat,
}

impl Message for Request {
    fn core(&self) -> &MessageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessageCore {
        &mut self.core
    }
}

impl Request {
    /// Origin-form request, e.g. `GET /index.html HTTP/1.1`.
    pub fn relative(method: &str, path: &str, http_version: &str) -> Self {
        Self {
            core: MessageCore::new(http_version, Headers::new(), Content::Absent),
            method: method.to_string(),
            scheme: None,
            host: None,
            port: None,
            path: Some(path.to_string()),
            first_line_format: FirstLineFormat::Relative,
        }
    }

    /// Absolute-form request as sent to a proxy.
    pub fn absolute(
        method: &str,
        scheme: &str,
        host: &str,
        port: u16,
        path: &str,
        http_version: &str,
    ) -> Self {
        Self {
            core: MessageCore::new(http_version, Headers::new(), Content::Absent),
            method: method.to_string(),
            scheme: Some(scheme.to_string()),
            host: Some(host.to_string()),
            port: Some(port),
            path: Some(path.to_string()),
            first_line_format: FirstLineFormat::Absolute,
        }
    }

    pub fn connect(host: &str, port: u16, http_version: &str) -> Self {
        Self {
            core: MessageCore::new(http_version, Headers::new(), Content::Absent),
            method: "CONNECT".to_string(),
            scheme: None,
            host: Some(host.to_string()),
            port: Some(port),
            path: None,
            first_line_format: FirstLineFormat::Authority,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Host as the client sees it: the `Host` header when present, else the target host.
    pub fn pretty_host(&self) -> Option<String> {
        if let Some(header) = self.core.headers.get("host") {
            if let Ok((host, _)) = parse_authority(&header, false) {
                return Some(host);
            }
        }
        self.host.clone()
    }

    pub fn scheme_or_default(&self) -> &str {
        self.scheme.as_deref().unwrap_or("http")
    }

    pub fn port_or_default(&self) -> u16 {
        self.port
            .unwrap_or_else(|| default_port(self.scheme_or_default()))
    }

    /// Full URL, using the `Host` header for relative requests.
    pub fn url(&self) -> String {
        let scheme = self.scheme_or_default();
        let authority = match (&self.host, self.core.headers.get("host")) {
            (Some(host), _) => hostport(scheme, host, self.port_or_default()),
            (None, Some(header)) => header,
            (None, None) => String::new(),
        };
        format!(
            "{}://{}{}",
            scheme,
            authority,
            self.path.as_deref().unwrap_or("")
        )
    }

    /// Request target as it appears on the HTTP/1 request line.
    pub fn target(&self) -> String {
        match self.first_line_format {
            FirstLineFormat::Relative => self.path.clone().unwrap_or_else(|| "/".to_string()),
            FirstLineFormat::Authority => format!(
                "{}:{}",
                bracket_v6(self.host.as_deref().unwrap_or("")),
                self.port_or_default()
            ),
            FirstLineFormat::Absolute => format!(
                "{}://{}{}",
                self.scheme_or_default(),
                hostport(
                    self.scheme_or_default(),
                    self.host.as_deref().unwrap_or(""),
                    self.port_or_default()
                ),
                self.path.as_deref().unwrap_or("/")
            ),
        }
    }

    /// Strip conditional headers so the server sends a full response.
    pub fn anticache(&mut self) {
        self.core.headers.remove("If-Modified-Since");
        self.core.headers.remove("If-None-Match");
    }

    /// Ask the server for an uncompressed response.
    pub fn anticomp(&mut self) {
        self.core.headers.set("Accept-Encoding", "identity");
    }

    /// Value of a cookie sent with the request.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.core
            .headers
            .get_all("cookie")
            .into_iter()
            .flat_map(|v| {
                String::from_utf8_lossy(v)
                    .split(';')
                    .map(|s| s.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == name).then(|| v.to_string())
            })
    }
}

fn bracket_v6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
