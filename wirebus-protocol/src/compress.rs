//! Pluggable payload compression.

use crate::error::ProtocolError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses and decompresses packet bodies.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Whether a single [`crate::SegmentedBuffer`] segment can be rewritten
    /// in place, letting the codec skip flattening before compression.
    fn compresses_segments(&self) -> bool {
        false
    }
}

/// Zlib compressor backed by flate2.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| ProtocolError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        Ok(out)
    }

    fn compresses_segments(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let compressor = ZlibCompressor;
        let data = b"a moderately repetitive payload payload payload payload";
        let packed = compressor.compress(data).unwrap();
        assert_eq!(compressor.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_compresses_repetition() {
        let compressor = ZlibCompressor;
        let data = vec![b'x'; 4096];
        let packed = compressor.compress(&data).unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn test_corrupt_input_fails() {
        let compressor = ZlibCompressor;
        assert!(compressor.decompress(b"definitely not zlib").is_err());
    }

    #[test]
    fn test_empty_roundtrip() {
        let compressor = ZlibCompressor;
        let packed = compressor.compress(&[]).unwrap();
        assert!(compressor.decompress(&packed).unwrap().is_empty());
    }
}
