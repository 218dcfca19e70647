//! Small helpers shared by the protocol layers.

use regex::Regex;
use std::sync::OnceLock;

/// Current wall-clock time as fractional seconds since the epoch.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// `host` or `host:port`, omitting the port when it is the scheme default.
pub fn hostport(scheme: &str, host: &str, port: u16) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == default_port(scheme) {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

/// Syntactic check for a domain name, IPv4 or IPv6 literal.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 255 || host.contains('\0') {
        return false;
    }
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match url::Host::parse(&candidate) {
        Ok(url::Host::Domain(domain)) => domain
            .trim_end_matches('.')
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63),
        Ok(_) => true,
        Err(_) => false,
    }
}

pub fn is_valid_port(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// Split an authority (`host`, `host:port`, `[v6]:port`) into its parts.
///
/// With `check` set, the host must be syntactically valid and the port in 1..=65535.
pub fn parse_authority(authority: &str, check: bool) -> Result<(String, Option<u16>), String> {
    static AUTHORITY_RE: OnceLock<Regex> = OnceLock::new();
    let re = AUTHORITY_RE.get_or_init(|| {
        Regex::new(r"^(?P<host>[^:\[\]]+|\[[^\]]+\])(?::(?P<port>\d+))?$")
            .expect("authority regex is valid")
    });

    let captures = re
        .captures(authority)
        .ok_or_else(|| format!("Invalid authority: {}", authority))?;

    let mut host = captures
        .name("host")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    if host.starts_with('[') && host.ends_with(']') {
        host = host[1..host.len() - 1].to_string();
    }

    if check && !is_valid_host(&host) {
        return Err(format!("Invalid host: {}", host));
    }

    let port = match captures.name("port") {
        Some(port) => {
            let port: u32 = port
                .as_str()
                .parse()
                .map_err(|_| format!("Invalid port: {}", port.as_str()))?;
            if !is_valid_port(port) {
                return Err(format!("Invalid port: {}", port));
            }
            Some(port as u16)
        }
        None => None,
    };

    Ok((host, port))
}
