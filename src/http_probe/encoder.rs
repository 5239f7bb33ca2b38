//! Request body encoders.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use hyper::HeaderMap;
use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncoderError {
    #[error("unsupported compression type {0:?}")]
    UnknownType(String),
    #[error("compression level {0} is outside 0..=9")]
    InvalidLevel(u32),
}

/// `check.request.compression`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CompressionConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub level: u32,
}

pub trait ContentEncoder: Send + Sync + std::fmt::Debug {
    fn add_headers(&self, headers: &mut HeaderMap);
    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> io::Result<()>;
}

pub fn new_content_encoder(
    config: &CompressionConfig,
) -> Result<Box<dyn ContentEncoder>, EncoderError> {
    if config.level > 9 {
        return Err(EncoderError::InvalidLevel(config.level));
    }
    match config.kind.as_str() {
        "" => Ok(Box::new(PlainEncoder)),
        "gzip" => Ok(Box::new(GzipEncoder {
            level: Compression::new(config.level),
        })),
        other => Err(EncoderError::UnknownType(other.to_string())),
    }
}

/// Copies the body unchanged.
#[derive(Debug, Clone, Copy)]
pub struct PlainEncoder;

impl ContentEncoder for PlainEncoder {
    fn add_headers(&self, _headers: &mut HeaderMap) {}

    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> io::Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GzipEncoder {
    level: Compression,
}

impl ContentEncoder for GzipEncoder {
    fn add_headers(&self, headers: &mut HeaderMap) {
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=UTF-8"),
            );
        }
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> io::Result<()> {
        let mut encoder = GzEncoder::new(dst, self.level);
        encoder.write_all(src)?;
        // Flush, then write the trailer, so the full payload size is known
        // before the request goes out.
        encoder.flush()?;
        encoder.finish()?;
        Ok(())
    }
}
