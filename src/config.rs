use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::utils::parse_authority;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub mode: ProxyMode,
    /// `host:port` all requests are sent to in reverse mode.
    pub reverse_target: Option<String>,
    pub confdir: String,
    /// Maximum body size in bytes, for requests and responses alike.
    pub body_size_limit: Option<usize>,
    /// Filter expression selecting flows to intercept.
    pub intercept: Option<String>,
    pub intercept_timeout_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    /// Accept HTTP/2 from clients.
    pub http2: bool,
    /// Speak HTTP/2 to upstream servers for HTTP/2 client flows.
    pub upstream_http2: bool,
    /// Reject requests carrying both Transfer-Encoding and Content-Length.
    pub reject_ambiguous_framing: bool,
    /// Relay non-HTTP tunnel content as raw TCP.
    pub rawtcp: bool,
    pub anticache: bool,
    pub anticomp: bool,
    pub decode_cache_size: usize,
    pub max_tcp_messages: usize,
    /// Append completed flows to this file.
    pub save_stream_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Regular,
    Reverse,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            mode: ProxyMode::Regular,
            reverse_target: None,
            confdir: "~/.mitmproxy-rs".to_string(),
            body_size_limit: None,
            intercept: None,
            intercept_timeout_secs: None,
            connect_timeout_secs: 10,
            http2: true,
            upstream_http2: true,
            reject_ambiguous_framing: true,
            rawtcp: true,
            anticache: false,
            anticomp: false,
            decode_cache_size: 16,
            max_tcp_messages: 1000,
            save_stream_file: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == ProxyMode::Reverse {
            self.reverse_address()?;
        }
        if self.decode_cache_size == 0 {
            return Err(Error::Other("decode_cache_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Parsed reverse-mode target.
    pub fn reverse_address(&self) -> Result<(String, u16)> {
        let target = self
            .reverse_target
            .as_deref()
            .ok_or_else(|| Error::Other("reverse mode requires reverse_target".to_string()))?;
        parse_authority(target, true)
            .map(|(host, port)| (host, port.unwrap_or(80)))
            .map_err(|e| Error::Other(format!("invalid reverse_target: {}", e)))
    }

    pub fn intercept_timeout(&self) -> Option<Duration> {
        self.intercept_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn expand_path(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
        path.to_string()
    }

    /// Default location of `config.json` inside the configuration directory.
    pub fn default_config_file(&self) -> String {
        format!("{}/config.json", self.expand_path(&self.confdir))
    }
}
