//! Value compression
//!
//! Values are compressed once on the write path and decompressed lazily on
//! reads. Compaction moves compressed bytes around untouched.

use crate::error::{CacheError, Result};

/// Byte codec applied to values
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block codec with the uncompressed size prepended
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, None, true)
            .map_err(|e| CacheError::Compression(format!("LZ4 compress: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None)
            .map_err(|e| CacheError::Compression(format!("LZ4 decompress: {}", e)))
    }
}

/// Pass-through codec
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCodec;

impl Codec for NoopCodec {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
