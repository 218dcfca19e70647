//! State shared by requests and responses.

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::encoding::{self, DecodeCache};
use super::headers::Headers;
use crate::{Error, Result};

/// A message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    /// The message has no body.
    #[default]
    Absent,
    /// A body was sent but not captured, so the message cannot be serialized.
    Missing,
    Data(Vec<u8>),
}

impl Content {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Content::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCore {
    pub http_version: String,
    pub headers: Headers,
    pub content: Content,
    pub timestamp_start: Option<f64>,
    pub timestamp_end: Option<f64>,
}

impl MessageCore {
    pub fn new(http_version: impl Into<String>, headers: Headers, content: Content) -> Self {
        Self {
            http_version: http_version.into(),
            headers,
            content,
            timestamp_start: None,
            timestamp_end: None,
        }
    }
}

impl Default for MessageCore {
    fn default() -> Self {
        Self::new("HTTP/1.1", Headers::new(), Content::Absent)
    }
}

pub trait Message {
    fn core(&self) -> &MessageCore;
    fn core_mut(&mut self) -> &mut MessageCore;

    fn http_version(&self) -> &str {
        &self.core().http_version
    }

    fn headers(&self) -> &Headers {
        &self.core().headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.core_mut().headers
    }

    /// Raw (possibly encoded) body bytes, if captured.
    fn content(&self) -> Option<&[u8]> {
        self.core().content.as_bytes()
    }

    /// Set the body and keep `Content-Length` in sync with it.
    fn set_content(&mut self, content: Vec<u8>) {
        let core = self.core_mut();
        core.headers.set("Content-Length", content.len().to_string());
        core.content = Content::Data(content);
    }

    /// Lower-cased `Content-Encoding`, if any.
    fn encoding(&self) -> Option<String> {
        self.headers()
            .get("content-encoding")
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
    }

    /// Decode the body in place and drop `Content-Encoding`.
    ///
    /// Returns `Ok(false)` when there was nothing to decode. On failure the
    /// message is left untouched.
    fn decode(&mut self) -> Result<bool> {
        let Some(encoding) = self.encoding() else {
            return Ok(false);
        };
        let Some(raw) = self.content() else {
            return Ok(false);
        };
        let decoded = encoding::decode(&encoding, raw)?;
        self.headers_mut().remove("Content-Encoding");
        self.set_content(decoded);
        Ok(true)
    }

    /// Encode the body in place and set `Content-Encoding`.
    fn encode(&mut self, encoding: &str) -> Result<()> {
        if !encoding::is_supported(encoding) {
            return Err(Error::decoding(format!("unsupported encoding: {}", encoding)));
        }
        if let Some(raw) = self.content() {
            let encoded = encoding::encode(encoding, raw)?;
            self.set_content(encoded);
        }
        self.headers_mut().set("Content-Encoding", encoding);
        Ok(())
    }

    /// Decoded body without modifying the message.
    fn get_decoded_content(&self, cache: Option<&mut DecodeCache>) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.content() else {
            return Ok(None);
        };
        match (self.encoding(), cache) {
            (None, _) => Ok(Some(raw.to_vec())),
            (Some(encoding), Some(cache)) => cache.decode(&encoding, raw).map(Some),
            (Some(encoding), None) => encoding::decode(&encoding, raw).map(Some),
        }
    }

    /// Body as text, decoded where possible.
    fn text(&self) -> Option<String> {
        let content = match self.get_decoded_content(None) {
            Ok(content) => content,
            Err(_) => self.content().map(|c| c.to_vec()),
        };
        content.map(|c| String::from_utf8_lossy(&c).into_owned())
    }

    /// Regex substitution over headers and the decoded body.
    ///
    /// Returns the number of replacements.
    fn replace(&mut self, pattern: &Regex, repl: &[u8]) -> usize
    where
        Self: Sized,
    {
        let mut count = self.headers_mut().replace(pattern, repl);
        count += decoded(self, |message| {
            let Some(content) = message.content() else {
                return 0;
            };
            let hits = pattern.find_iter(content).count();
            if hits > 0 {
                let replaced = pattern.replace_all(content, repl).into_owned();
                message.set_content(replaced);
            }
            hits
        });
        count
    }
}

/// Run `f` on the decoded message, then restore the original encoding.
///
/// When decoding fails `f` sees the raw body.
pub fn decoded<M, T, F>(message: &mut M, f: F) -> T
where
    M: Message,
    F: FnOnce(&mut M) -> T,
{
    let encoding = message.encoding();
    let was_decoded = match message.decode() {
        Ok(done) => done,
        Err(e) => {
            warn!(error = %e, "leaving content encoded");
            false
        }
    };

    let result = f(message);

    if was_decoded {
        if let Some(encoding) = encoding {
            if let Err(e) = message.encode(&encoding) {
                warn!(error = %e, encoding = %encoding, "failed to re-encode content");
            } else {
                debug!(encoding = %encoding, "restored content encoding");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(MessageCore);

    impl Message for Plain {
        fn core(&self) -> &MessageCore {
            &self.0
        }
        fn core_mut(&mut self) -> &mut MessageCore {
            &mut self.0
        }
    }

    fn gzipped(body: &[u8]) -> Plain {
        let mut message = Plain(MessageCore::default());
        message.set_content(body.to_vec());
        message.encode("gzip").unwrap();
        message
    }

    #[test]
    fn test_set_content_updates_length() {
        let mut message = Plain(MessageCore::default());
        message.set_content(b"hello".to_vec());
        assert_eq!(message.headers().get("content-length").as_deref(), Some("5"));
        message.set_content(Vec::new());
        assert_eq!(message.headers().get("content-length").as_deref(), Some("0"));
    }

    #[test]
    fn test_decode_encode() {
        let mut message = gzipped(b"payload");
        assert_eq!(message.encoding().as_deref(), Some("gzip"));
        assert_ne!(message.content().unwrap(), b"payload");

        assert!(message.decode().unwrap());
        assert_eq!(message.content().unwrap(), b"payload");
        assert!(!message.headers().contains("content-encoding"));
        assert!(!message.decode().unwrap());
    }

    #[test]
    fn test_decoded_restores_encoding() {
        let mut message = gzipped(b"payload");
        decoded(&mut message, |m| {
            assert_eq!(m.content().unwrap(), b"payload");
            m.set_content(b"changed".to_vec());
        });
        assert_eq!(message.encoding().as_deref(), Some("gzip"));
        assert_eq!(message.get_decoded_content(None).unwrap().unwrap(), b"changed");
    }

    #[test]
    fn test_replace_in_encoded_body() {
        let mut message = gzipped(b"foo bar foo");
        message.headers_mut().set("X-Foo", "foo");
        let pattern = Regex::new("foo").unwrap();
        assert_eq!(message.replace(&pattern, b"baz"), 3);
        assert_eq!(message.encoding().as_deref(), Some("gzip"));
        assert_eq!(message.text().unwrap(), "baz bar baz");
        assert_eq!(message.headers().get("x-foo").as_deref(), Some("baz"));
    }

    #[test]
    fn test_replace_falls_back_to_raw_bytes() {
        let mut message = Plain(MessageCore::default());
        message.set_content(b"not really gzip".to_vec());
        message.headers_mut().set("Content-Encoding", "gzip");

        let pattern = Regex::new("really").unwrap();
        assert_eq!(message.replace(&pattern, b"quite"), 1);
        assert_eq!(message.content().unwrap(), b"not quite gzip");
        assert_eq!(message.encoding().as_deref(), Some("gzip"));
    }

    #[test]
    fn test_decoded_content_through_cache() {
        let message = gzipped(b"cached");
        let mut cache = DecodeCache::new(4);
        assert_eq!(
            message.get_decoded_content(Some(&mut cache)).unwrap().unwrap(),
            b"cached"
        );
        message.get_decoded_content(Some(&mut cache)).unwrap();
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_missing_content() {
        let message = Plain(MessageCore::new("HTTP/1.1", Headers::new(), Content::Missing));
        assert!(message.content().is_none());
        assert!(message.core().content.is_missing());
    }
}
