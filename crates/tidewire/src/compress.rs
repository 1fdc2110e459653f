//! # Payload Compression
//!
//! Compression is selected per frame by the header's compression byte.
//! `Compression::NONE` and `Compression::GZIP` are built in; other bytes are
//! served by compressors registered in a `Registry`.

use std::io::Read;
use std::io::Write;

use flate2::Compression as Level;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::Error;
use crate::error::Result;

/// The compression byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Compression(pub u8);

impl Compression {
    pub const NONE: Self = Self(0);
    pub const GZIP: Self = Self(1);

    /// The built-in compressor for this kind, if it has one.
    pub fn builtin(self) -> Option<&'static dyn Compressor> {
        match self {
            Self::NONE => Some(&RawCompressor),
            Self::GZIP => Some(&GzipCompressor),
            _ => None,
        }
    }
}

/// A reversible byte transformation applied to payloads.
pub trait Compressor: Send + Sync {
    fn zip(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Restores `data`, failing with `Error::FrameTooLarge` rather than
    /// producing more than `limit` bytes.
    fn unzip(&self, data: &[u8], limit: usize) -> Result<Vec<u8>>;

    /// True if `zip` and `unzip` leave bytes untouched.
    fn is_identity(&self) -> bool {
        false
    }
}

/// Identity transform.
pub struct RawCompressor;

impl Compressor for RawCompressor {
    fn zip(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn unzip(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        if data.len() > limit {
            return Err(Error::FrameTooLarge { len: data.len(), max: limit });
        }
        Ok(data.to_vec())
    }

    fn is_identity(&self) -> bool {
        true
    }
}

/// Gzip at the default level.
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn zip(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Level::default());
        enc.write_all(data).map_err(|e| Error::Compression(e.to_string()))?;
        enc.finish().map_err(|e| Error::Compression(e.to_string()))
    }

    fn unzip(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
        // one byte past the limit is enough to tell an oversized payload apart
        GzDecoder::new(data)
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::Compression(e.to_string()))?;
        if out.len() > limit {
            return Err(Error::FrameTooLarge { len: out.len(), max: limit });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_restores_input() {
        let input = b"tide tide tide tide tide tide tide tide".repeat(32);
        let zipped = GzipCompressor.zip(&input).unwrap();
        assert!(zipped.len() < input.len());
        assert_eq!(GzipCompressor.unzip(&zipped, input.len()).unwrap(), input);
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let err = GzipCompressor.unzip(b"definitely not gzip", 1024).unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[test]
    fn test_gzip_stops_at_limit() {
        let zipped = GzipCompressor.zip(&vec![0u8; 64 * 1024]).unwrap();
        let err = GzipCompressor.unzip(&zipped, 1000).unwrap_err();
        assert_eq!(err, Error::FrameTooLarge { len: 1001, max: 1000 });
        assert!(err.is_framing());
    }

    #[test]
    fn test_builtin_kinds() {
        assert!(Compression::NONE.builtin().unwrap().is_identity());
        assert!(!Compression::GZIP.builtin().unwrap().is_identity());
        assert!(Compression(2).builtin().is_none());
        assert_eq!(Compression::default(), Compression::NONE);
    }
}
