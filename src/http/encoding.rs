//! Content-Encoding codecs: identity, gzip, deflate and brotli.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::{Error, Result};

pub const SUPPORTED_ENCODINGS: &[&str] = &["identity", "gzip", "deflate", "br"];

pub fn is_supported(encoding: &str) -> bool {
    SUPPORTED_ENCODINGS
        .iter()
        .any(|e| e.eq_ignore_ascii_case(encoding.trim()))
}

pub fn decode(encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "identity" | "none" => Ok(data.to_vec()),
        "gzip" | "x-gzip" => decode_gzip(data),
        "deflate" => decode_deflate(data),
        "br" => decode_brotli(data),
        other => Err(Error::decoding(format!("unsupported encoding: {}", other))),
    }
}

pub fn encode(encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "identity" | "none" => Ok(data.to_vec()),
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        "br" => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 11, 22);
                writer.write_all(data)?;
                writer.flush()?;
            }
            Ok(out)
        }
        other => Err(Error::decoding(format!("unsupported encoding: {}", other))),
    }
}

fn decode_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::decoding(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

/// zlib-wrapped deflate, falling back to raw deflate streams some servers send.
fn decode_deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::decoding(format!("deflate decode failed: {}", e)))?;
    Ok(out)
}

fn decode_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut out)
        .map_err(|e| Error::decoding(format!("brotli decode failed: {}", e)))?;
    Ok(out)
}

/// Small memo of recent decode results, owned by one connection.
#[derive(Debug)]
pub struct DecodeCache {
    capacity: usize,
    entries: IndexMap<(String, [u8; 32]), Vec<u8>>,
    hits: u64,
}

impl DecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
            hits: 0,
        }
    }

    pub fn decode(&mut self, encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
        let key = (
            encoding.trim().to_ascii_lowercase(),
            Sha256::digest(data).into(),
        );
        if let Some(decoded) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(decoded.clone());
        }
        let decoded = decode(&key.0, data)?;
        if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, decoded.clone());
        Ok(decoded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}
