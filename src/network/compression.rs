use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::config::CompressionScheme;

/// Payloads below this size are never compressed
pub const COMPRESSION_THRESHOLD: u16 = 512;

/// Envelope marker for zlib-compressed payloads
pub const MARKER_ZLIB: u8 = 0x00;
/// Envelope marker for stored payloads
pub const MARKER_NONE: u8 = 0xFF;

/// Upper bound on an inflated packet
const MAX_INFLATED: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Empty compression envelope")]
    Empty,

    #[error("Unknown compression marker {0:#04x}")]
    UnknownMarker(u8),

    #[error("Inflated payload exceeds limit")]
    TooLarge,

    #[error("Zlib error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompressionScheme {
    /// Wire id sent in the settings response
    pub fn wire_id(self) -> u16 {
        match self {
            CompressionScheme::Zlib => 0,
            CompressionScheme::None => 0xFFFF,
        }
    }

    pub fn from_wire_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(CompressionScheme::Zlib),
            0xFFFF => Some(CompressionScheme::None),
            _ => None,
        }
    }
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Wrap `data` in a compression envelope.
pub fn compress(scheme: CompressionScheme, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if scheme == CompressionScheme::Zlib && data.len() >= COMPRESSION_THRESHOLD as usize {
        let mut out = vec![MARKER_ZLIB];
        out.extend(zlib_compress(data)?);
        return Ok(out);
    }
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(MARKER_NONE);
    out.extend_from_slice(data);
    Ok(out)
}

/// Unwrap a compression envelope.
pub fn decompress(envelope: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&marker, body) = envelope.split_first().ok_or(CompressionError::Empty)?;
    match marker {
        MARKER_NONE => Ok(body.to_vec()),
        MARKER_ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(body).take(MAX_INFLATED + 1).read_to_end(&mut out)?;
            if out.len() as u64 > MAX_INFLATED {
                return Err(CompressionError::TooLarge);
            }
            Ok(out)
        }
        other => Err(CompressionError::UnknownMarker(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_stored() {
        let env = compress(CompressionScheme::Zlib, b"tiny").unwrap();
        assert_eq!(env[0], MARKER_NONE);
        assert_eq!(decompress(&env).unwrap(), b"tiny");
    }

    #[test]
    fn test_large_payload_deflated() {
        let data = vec![0x42u8; 4096];
        let env = compress(CompressionScheme::Zlib, &data).unwrap();
        assert_eq!(env[0], MARKER_ZLIB);
        assert!(env.len() < data.len());
        assert_eq!(decompress(&env).unwrap(), data);
    }

    #[test]
    fn test_none_scheme_never_deflates() {
        let data = vec![0x42u8; 4096];
        let env = compress(CompressionScheme::None, &data).unwrap();
        assert_eq!(env[0], MARKER_NONE);
    }

    #[test]
    fn test_unknown_marker() {
        assert!(matches!(decompress(&[0x07, 1, 2]), Err(CompressionError::UnknownMarker(0x07))));
        assert!(matches!(decompress(&[]), Err(CompressionError::Empty)));
    }
}
