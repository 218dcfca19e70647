//! Ordered, case-insensitive, duplicate-preserving header container.

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type HeaderField = (Vec<u8>, Vec<u8>);

/// Header fields as they appeared on the wire.
///
/// Entries keep their insertion order and original casing. Several entries may
/// share a name; lookups fold case.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

fn name_eq(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Vec<HeaderField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<HeaderField> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| name_eq(n, name.as_bytes()))
    }

    /// Value of `name`, with duplicates folded into one comma-separated value.
    ///
    /// `Set-Cookie` is never folded; the first entry is returned instead.
    pub fn get(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case("set-cookie") {
            return self
                .get_first(name)
                .map(|v| String::from_utf8_lossy(v).into_owned());
        }
        let values = self.get_all(name);
        if values.is_empty() {
            return None;
        }
        let folded = values
            .iter()
            .map(|v| String::from_utf8_lossy(v))
            .collect::<Vec<_>>()
            .join(", ");
        Some(folded)
    }

    pub fn get_first(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(n, _)| name_eq(n, name.as_bytes()))
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_all(&self, name: &str) -> Vec<&[u8]> {
        self.fields
            .iter()
            .filter(|(n, _)| name_eq(n, name.as_bytes()))
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    /// Replace every `name` entry with a single one at the position of the first.
    pub fn set(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.set_all(name, vec![value.as_ref().to_vec()]);
    }

    /// Replace every `name` entry with `values`, keeping the position of the first.
    pub fn set_all(&mut self, name: &str, values: Vec<Vec<u8>>) {
        let position = self
            .fields
            .iter()
            .position(|(n, _)| name_eq(n, name.as_bytes()));
        self.fields.retain(|(n, _)| !name_eq(n, name.as_bytes()));
        let at = position.unwrap_or(self.fields.len());
        for (offset, value) in values.into_iter().enumerate() {
            self.fields
                .insert(at + offset, (name.as_bytes().to_vec(), value));
        }
    }

    pub fn append(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.fields
            .push((name.as_ref().to_vec(), value.as_ref().to_vec()));
    }

    pub fn insert(&mut self, index: usize, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let index = index.min(self.fields.len());
        self.fields
            .insert(index, (name.as_ref().to_vec(), value.as_ref().to_vec()));
    }

    /// Remove every `name` entry. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !name_eq(n, name.as_bytes()));
        before != self.fields.len()
    }

    /// Lower-cased, comma-separated tokens across all `name` entries.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .into_iter()
            .flat_map(|v| {
                String::from_utf8_lossy(v)
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).iter().any(|t| t == token)
    }

    /// Regex substitution over names and values. Returns the number of replacements.
    pub fn replace(&mut self, pattern: &Regex, repl: &[u8]) -> usize {
        let mut count = 0;
        for (name, value) in self.fields.iter_mut() {
            for part in [name, value] {
                let hits = pattern.find_iter(&part[..]).count();
                if hits > 0 {
                    let replaced = pattern.replace_all(&part[..], repl).into_owned();
                    *part = replaced;
                    count += hits;
                }
            }
        }
        count
    }

    /// Wire form: `Name: value\r\n` per entry, no trailing blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|(n, v)| {
                (String::from_utf8_lossy(n), String::from_utf8_lossy(v))
            }))
            .finish()
    }
}

impl<N: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(n, v)| (n.as_ref().to_vec(), v.as_ref().to_vec()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Headers {
        Headers::from_iter([
            ("Host", "example.com"),
            ("Accept", "text/html"),
            ("Set-Cookie", "a=1"),
            ("accept", "application/json"),
            ("Set-Cookie", "b=2"),
        ])
    }

    #[test]
    fn test_get_folds_duplicates() {
        let headers = sample();
        assert_eq!(
            headers.get("ACCEPT").as_deref(),
            Some("text/html, application/json")
        );
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_set_cookie_never_folded() {
        let headers = sample();
        assert_eq!(headers.get("set-cookie").as_deref(), Some("a=1"));
        assert_eq!(
            headers.get_all("Set-Cookie"),
            vec![b"a=1".as_slice(), b"b=2".as_slice()]
        );
    }

    #[test]
    fn test_set_keeps_first_position() {
        let mut headers = sample();
        headers.set("accept", "*/*");
        let names: Vec<_> = headers.iter().map(|(n, _)| n.to_vec()).collect();
        assert_eq!(
            names,
            vec![
                b"Host".to_vec(),
                b"accept".to_vec(),
                b"Set-Cookie".to_vec(),
                b"Set-Cookie".to_vec()
            ]
        );
        assert_eq!(headers.get("Accept").as_deref(), Some("*/*"));

        headers.set("X-New", "1");
        assert_eq!(headers.fields().last().unwrap().0, b"X-New".to_vec());
    }

    #[test]
    fn test_tokens() {
        let headers = Headers::from_iter([
            ("Transfer-Encoding", "gzip, Chunked"),
            ("Connection", "keep-alive"),
        ]);
        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert_eq!(headers.tokens("transfer-encoding"), vec!["gzip", "chunked"]);
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn test_replace_counts() {
        let mut headers = sample();
        let pattern = Regex::new("a=").unwrap();
        assert_eq!(headers.replace(&pattern, b"x="), 1);
        assert_eq!(headers.get_first("set-cookie"), Some(b"x=1".as_slice()));
    }

    #[test]
    fn test_to_bytes_preserves_order_and_case() {
        let headers = Headers::from_iter([("Set-Cookie", "a=1"), ("set-cookie", "b=2")]);
        assert_eq!(headers.to_bytes(), b"Set-Cookie: a=1\r\nset-cookie: b=2\r\n".to_vec());
    }
}
