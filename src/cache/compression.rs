//! Payload Compression
//!
//! Optional compression of record payloads written to the disk tier. A
//! payload that does not shrink is stored raw and tagged `None`.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payloads smaller than this are never compressed
pub const MIN_COMPRESS_BYTES: usize = 512;

/// Compression algorithm identifier, stored in each record header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Zstd,
    Snappy,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

impl CompressionAlgorithm {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::compress(data, None, true)
                .map_err(|e| Error::Serialization(format!("lz4 compression failed: {}", e))),
            CompressionAlgorithm::Zstd => zstd::encode_all(data, 3)
                .map_err(|e| Error::Serialization(format!("zstd compression failed: {}", e))),
            CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::Serialization(format!("snappy compression failed: {}", e))),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map_err(|e| Error::Serialization(format!("lz4 decompression failed: {}", e))),
            CompressionAlgorithm::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::Serialization(format!("zstd decompression failed: {}", e))),
            CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::Serialization(format!("snappy decompression failed: {}", e))),
        }
    }

    /// Compress `data`, falling back to raw storage when it does not help
    ///
    /// Returns the stored bytes and the algorithm actually applied.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if *self == CompressionAlgorithm::None || data.len() < MIN_COMPRESS_BYTES {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }
        match self.encode(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), *self),
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(algorithm = %self, error = %e, "compression failed, storing raw");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse [`compress`](Self::compress) using the algorithm recorded for the payload
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        self.decode(data).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"<div class=\"product\">catalog fragment</div>\n".repeat(40)
    }

    #[test]
    fn test_each_algorithm_restores_payload() {
        let data = sample();
        for algorithm in [
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let (stored, applied) = algorithm.compress(&data);
            assert_eq!(applied, algorithm);
            assert!(stored.len() < data.len());
            assert_eq!(applied.decompress(&stored).unwrap().as_ref(), data.as_slice());
        }
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let (stored, applied) = CompressionAlgorithm::Zstd.compress(b"tiny");
        assert_eq!(applied, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), b"tiny");
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let (stored, applied) = CompressionAlgorithm::Lz4.compress(&data);
        if applied == CompressionAlgorithm::None {
            assert_eq!(stored.len(), data.len());
        } else {
            assert!(stored.len() < data.len());
        }
    }

    #[test]
    fn test_corrupt_payload_errors() {
        assert!(CompressionAlgorithm::Zstd.decompress(b"not zstd").is_err());
    }
}
