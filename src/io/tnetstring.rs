//! Typed netstrings: `<len>:<payload><type>`.
//!
//! Type tags: `,` bytes, `;` text, `#` integer, `^` float, `!` boolean,
//! `~` null, `]` list, `}` dictionary of alternating keys and values.

use indexmap::IndexMap;
use std::io::{BufRead, Read, Write};

use crate::{Error, Result};

/// Longest length prefix accepted when reading: 9 digits.
const MAX_LENGTH_DIGITS: usize = 9;
/// Deepest list/dictionary nesting accepted when reading.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum TValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<TValue>),
    Dict(IndexMap<String, TValue>),
}

impl TValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            TValue::Null => "null",
            TValue::Bool(_) => "bool",
            TValue::Int(_) => "int",
            TValue::Float(_) => "float",
            TValue::Bytes(_) => "bytes",
            TValue::String(_) => "string",
            TValue::List(_) => "list",
            TValue::Dict(_) => "dict",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers are accepted where a float is expected.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            TValue::Float(f) => Some(*f),
            TValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Bytes or text, as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TValue::Bytes(b) => Some(b),
            TValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TValue::String(s) => Some(s),
            TValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TValue]> {
        match self {
            TValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, TValue>> {
        match self {
            TValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for TValue {
    fn from(b: bool) -> Self {
        TValue::Bool(b)
    }
}

impl From<i64> for TValue {
    fn from(i: i64) -> Self {
        TValue::Int(i)
    }
}

impl From<f64> for TValue {
    fn from(f: f64) -> Self {
        TValue::Float(f)
    }
}

impl From<&str> for TValue {
    fn from(s: &str) -> Self {
        TValue::String(s.to_string())
    }
}

impl From<String> for TValue {
    fn from(s: String) -> Self {
        TValue::String(s)
    }
}

impl From<Vec<u8>> for TValue {
    fn from(b: Vec<u8>) -> Self {
        TValue::Bytes(b)
    }
}

impl<T: Into<TValue>> From<Option<T>> for TValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(TValue::Null, Into::into)
    }
}

pub fn dumps(value: &TValue) -> Vec<u8> {
    let mut out = Vec::new();
    dump_into(value, &mut out);
    out
}

fn frame(out: &mut Vec<u8>, payload: &[u8], tag: u8) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(tag);
}

fn dump_into(value: &TValue, out: &mut Vec<u8>) {
    match value {
        TValue::Null => out.extend_from_slice(b"0:~"),
        TValue::Bool(true) => out.extend_from_slice(b"4:true!"),
        TValue::Bool(false) => out.extend_from_slice(b"5:false!"),
        TValue::Int(i) => frame(out, i.to_string().as_bytes(), b'#'),
        TValue::Float(f) => frame(out, format!("{:?}", f).as_bytes(), b'^'),
        TValue::Bytes(b) => frame(out, b, b','),
        TValue::String(s) => frame(out, s.as_bytes(), b';'),
        TValue::List(items) => {
            let mut payload = Vec::new();
            for item in items {
                dump_into(item, &mut payload);
            }
            frame(out, &payload, b']');
        }
        TValue::Dict(entries) => {
            let mut payload = Vec::new();
            for (key, item) in entries {
                frame(&mut payload, key.as_bytes(), b';');
                dump_into(item, &mut payload);
            }
            frame(out, &payload, b'}');
        }
    }
}

/// Write one value.
pub fn dump<W: Write>(value: &TValue, writer: &mut W) -> Result<()> {
    writer.write_all(&dumps(value))?;
    Ok(())
}

/// Parse exactly one value; trailing bytes are an error.
pub fn loads(data: &[u8]) -> Result<TValue> {
    let (value, rest) = pop(data)?;
    if !rest.is_empty() {
        return Err(Error::record(format!("{} trailing bytes", rest.len())));
    }
    Ok(value)
}

fn split_length(data: &[u8]) -> Result<(usize, &[u8])> {
    let colon = data
        .iter()
        .take(MAX_LENGTH_DIGITS + 1)
        .position(|&b| b == b':')
        .ok_or_else(|| Error::record("missing length prefix"))?;
    let digits = &data[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::record(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|d| d.parse::<usize>().ok())
        .ok_or_else(|| Error::record("invalid length prefix"))?;
    Ok((len, &data[colon + 1..]))
}

/// Parse one value from the front of `data` and return it with the remainder.
pub fn pop(data: &[u8]) -> Result<(TValue, &[u8])> {
    pop_nested(data, 0)
}

fn pop_nested(data: &[u8], depth: usize) -> Result<(TValue, &[u8])> {
    let (len, rest) = split_length(data)?;
    if rest.len() < len + 1 {
        return Err(Error::record(format!(
            "truncated value: need {} bytes, have {}",
            len + 1,
            rest.len()
        )));
    }
    let payload = &rest[..len];
    let tag = rest[len];
    Ok((parse_payload(payload, tag, depth)?, &rest[len + 1..]))
}

fn payload_str(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| Error::record(format!("invalid UTF-8: {}", e)))
}

fn parse_payload(payload: &[u8], tag: u8, depth: usize) -> Result<TValue> {
    if matches!(tag, b']' | b'}') && depth >= MAX_DEPTH {
        return Err(Error::record(format!("nesting deeper than {} levels", MAX_DEPTH)));
    }
    let value = match tag {
        b',' => TValue::Bytes(payload.to_vec()),
        b';' => TValue::String(payload_str(payload)?.to_string()),
        b'#' => TValue::Int(
            payload_str(payload)?
                .parse()
                .map_err(|_| Error::record("invalid integer"))?,
        ),
        b'^' => TValue::Float(
            payload_str(payload)?
                .parse()
                .map_err(|_| Error::record("invalid float"))?,
        ),
        b'!' => match payload {
            b"true" => TValue::Bool(true),
            b"false" => TValue::Bool(false),
            _ => return Err(Error::record("invalid boolean")),
        },
        b'~' => {
            if !payload.is_empty() {
                return Err(Error::record("null with payload"));
            }
            TValue::Null
        }
        b']' => {
            let mut items = Vec::new();
            let mut rest = payload;
            while !rest.is_empty() {
                let (item, remainder) = pop_nested(rest, depth + 1)?;
                items.push(item);
                rest = remainder;
            }
            TValue::List(items)
        }
        b'}' => {
            let mut entries = IndexMap::new();
            let mut rest = payload;
            while !rest.is_empty() {
                let (key, remainder) = pop_nested(rest, depth + 1)?;
                let key = match key {
                    TValue::String(s) => s,
                    TValue::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                    other => {
                        return Err(Error::record(format!(
                            "dictionary key must be text, got {}",
                            other.type_name()
                        )))
                    }
                };
                if remainder.is_empty() {
                    return Err(Error::record(format!("missing value for key {:?}", key)));
                }
                let (value, remainder) = pop_nested(remainder, depth + 1)?;
                entries.insert(key, value);
                rest = remainder;
            }
            TValue::Dict(entries)
        }
        other => {
            return Err(Error::record(format!(
                "unknown type tag {:?}",
                other as char
            )))
        }
    };
    Ok(value)
}

/// Read one value from a stream. Returns `None` at a clean end of input.
pub fn load<R: BufRead>(reader: &mut R) -> Result<Option<TValue>> {
    let mut prefix = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte)? == 0 {
            if prefix.is_empty() {
                return Ok(None);
            }
            return Err(Error::record("truncated length prefix"));
        }
        prefix.push(byte[0]);
        if byte[0] == b':' {
            break;
        }
        if prefix.len() > MAX_LENGTH_DIGITS {
            return Err(Error::record("length prefix too long"));
        }
    }
    let (len, _) = split_length(&prefix)?;
    let mut rest = vec![0u8; len + 1];
    reader
        .read_exact(&mut rest)
        .map_err(|e| Error::record(format!("truncated value: {}", e)))?;
    let tag = rest[len];
    parse_payload(&rest[..len], tag, 0).map(Some)
}
