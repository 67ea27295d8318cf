//! Compression codecs recognised inside game dumps.
//!
//! # Identity rules
//! A codec is identified on disk only by the magic its stream starts with.
//! Detection never guesses beyond that magic: a blob that merely resembles a
//! stream is handed to the codec, and a decode failure is reported as
//! [`CodecError::Decompression`] so the caller can keep the original bytes.
//!
//! # Limits
//! Every decode is bounded.  Output beyond `limit` bytes aborts the decode with
//! [`CodecError::TooLarge`] before the excess is buffered.

use std::io::{self, Read, Write};
use thiserror::Error;

// ── Frozen stream magics ──────────────────────────────────────────────────────

/// Zstandard frame magic (0xFD2FB528, little-endian on disk).
pub const MAGIC_ZSTD:      [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
/// LZ4 frame magic (0x184D2204, little-endian on disk).
pub const MAGIC_LZ4_FRAME: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
/// Property byte written by virtually every LZMA-alone encoder (lc=3 lp=0 pb=2).
pub const LZMA_DEFAULT_PROPS: u8 = 0x5D;
/// Size of the LZMA-alone header: props, dict size, unpacked size.
pub const LZMA_HEADER_SIZE: usize = 13;

// ── CodecId ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Zstd,
    Lz4,
    Lzma,
}

impl CodecId {
    /// Human-readable name, used in diagnostics only.
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Zstd => "zstd",
            CodecId::Lz4  => "lz4",
            CodecId::Lzma => "lzma",
        }
    }

    /// Identify the codec whose stream starts at the beginning of `data`.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&MAGIC_ZSTD) {
            return Some(CodecId::Zstd);
        }
        if data.starts_with(&MAGIC_LZ4_FRAME) {
            return Some(CodecId::Lz4);
        }
        if looks_like_lzma_alone(data) {
            return Some(CodecId::Lzma);
        }
        None
    }
}

fn looks_like_lzma_alone(data: &[u8]) -> bool {
    if data.len() < LZMA_HEADER_SIZE || data[0] != LZMA_DEFAULT_PROPS {
        return false;
    }
    let dict = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    if dict < 4096 || !dict.is_power_of_two() {
        return false;
    }
    let unpacked = u64::from_le_bytes([
        data[5], data[6], data[7], data[8], data[9], data[10], data[11], data[12],
    ]);
    // Either "unknown" or something an encoder could have produced from a dump.
    unpacked == u64::MAX || unpacked < (1 << 40)
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Decompressed output exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Bounded output ───────────────────────────────────────────────────────────

/// `Write` sink that refuses to grow past `limit` bytes.
struct BoundedSink {
    buf:      Vec<u8>,
    limit:    usize,
    exceeded: bool,
}

impl BoundedSink {
    fn new(limit: usize) -> Self {
        Self { buf: Vec::new(), limit, exceeded: false }
    }

    fn finish(self, result: Result<(), String>) -> Result<Vec<u8>, CodecError> {
        if self.exceeded {
            return Err(CodecError::TooLarge { limit: self.limit });
        }
        result.map_err(CodecError::Decompression)?;
        Ok(self.buf)
    }
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buf.len() + buf.len() > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(io::ErrorKind::Other, "output limit exceeded"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

fn drain_into<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut sink = BoundedSink::new(limit);
    let result = io::copy(&mut reader, &mut sink).map(|_| ()).map_err(|e| e.to_string());
    sink.finish(result)
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Decode `data`, failing once more than `limit` bytes would be produced.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        drain_into(decoder, limit)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        drain_into(lz4_flex::frame::FrameDecoder::new(data), limit)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let mut sink = BoundedSink::new(limit);
        let result = lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut sink)
            .map_err(|e| e.to_string());
        sink.finish(result)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::Zstd => Box::new(ZstdCodec),
        CodecId::Lz4  => Box::new(Lz4Codec),
        CodecId::Lzma => Box::new(LzmaCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        b"MThd sequence payload ".iter().copied().cycle().take(8192).collect()
    }

    #[test]
    fn detect_by_magic() {
        for id in [CodecId::Zstd, CodecId::Lz4, CodecId::Lzma] {
            let packed = get_codec(id).compress(&payload(), 3).unwrap();
            assert_eq!(CodecId::detect(&packed), Some(id), "{}", id.name());
            assert_eq!(get_codec(id).decompress(&packed, 1 << 20).unwrap(), payload());
        }
        assert_eq!(CodecId::detect(b"MThd\x00\x00\x00\x06"), None);
        assert_eq!(CodecId::detect(&[]), None);
    }

    #[test]
    fn limit_is_enforced() {
        let packed = ZstdCodec.compress(&vec![0u8; 100_000], 3).unwrap();
        assert!(matches!(
            ZstdCodec.decompress(&packed, 1000),
            Err(CodecError::TooLarge { limit: 1000 })
        ));
    }

    #[test]
    fn corrupt_stream_is_an_error() {
        let mut packed = Lz4Codec.compress(&payload(), 0).unwrap();
        packed.truncate(packed.len() / 2);
        assert!(Lz4Codec.decompress(&packed, 1 << 20).is_err());
    }
}
