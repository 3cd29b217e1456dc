//! Body compression with a size threshold.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression as Level;

use crate::wire::Compression;

use super::CodecError;

/// Default threshold below which bodies are sent uncompressed.
pub const DEFAULT_THRESHOLD: usize = 512;

/// Compresses bodies at or above a size threshold.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    kind: Compression,
    threshold: usize,
}

impl Compressor {
    pub fn new(kind: Compression, threshold: usize) -> Self {
        Self { kind, threshold }
    }

    pub fn kind(&self) -> Compression {
        self.kind
    }

    /// Compress `data` if it is large enough and compression actually
    /// shrinks it. Returns `None` when the body should go out as is.
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        if self.kind == Compression::None || data.len() < self.threshold {
            return Ok(None);
        }
        let out = match self.kind {
            Compression::Gzip => {
                let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Level::default());
                enc.write_all(data)?;
                enc.finish()?
            }
            Compression::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Level::default());
                enc.write_all(data)?;
                enc.finish()?
            }
            Compression::Zstd => zstd::stream::encode_all(data, 0)?,
            Compression::None => return Ok(None),
        };
        Ok((out.len() < data.len()).then_some(out))
    }
}

/// Decompress `data`, refusing output larger than `limit` bytes.
pub fn decompress(kind: Compression, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    match kind {
        Compression::None => Err(CodecError::UnsupportedFlag(crate::wire::flags::COMPRESSED)),
        Compression::Gzip => read_limited(GzDecoder::new(data), limit),
        Compression::Deflate => read_limited(DeflateDecoder::new(data), limit),
        Compression::Zstd => read_limited(zstd::stream::read::Decoder::new(data)?, limit),
    }
}

fn read_limited<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::DecompressedTooLarge(limit));
    }
    Ok(out)
}
