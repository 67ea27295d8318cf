//! Pre-processors that may replace a [`ByteSource`] before it is scanned.
//!
//! Loaders run in registration order.  A loader that returns
//! [`LoadOutcome::Replace`] hands the registry a derived source, which
//! re-enters the pipeline from the first loader; the original is dropped.
//! A loader that cannot make sense of a source it claimed (say, a truncated
//! stream or an implausibly large payload) logs the problem and returns
//! [`LoadOutcome::Keep`] so the bytes are still scanned as-is.

use crate::codec::{get_codec, CodecError, CodecId};
use crate::diagnostics::Diagnostics;
use crate::source::ByteSource;

pub enum LoadOutcome {
    Keep,
    Replace(ByteSource),
}

pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect `source`, optionally producing a replacement for it.
    fn apply(&self, source: &ByteSource, log: &mut Diagnostics) -> LoadOutcome;
}

// ── DecompressLoader ──────────────────────────────────────────────────────────

/// Unwraps sources that are a single zstd, LZ4 or LZMA stream.
pub struct DecompressLoader {
    max_output: usize,
}

impl DecompressLoader {
    pub fn new(max_output: usize) -> Self {
        Self { max_output }
    }
}

impl Loader for DecompressLoader {
    fn name(&self) -> &'static str { "decompress" }

    fn apply(&self, source: &ByteSource, log: &mut Diagnostics) -> LoadOutcome {
        let Some(codec) = CodecId::detect(source.as_slice()) else {
            return LoadOutcome::Keep;
        };
        let component = "loader/decompress";
        match get_codec(codec).decompress(source.as_slice(), self.max_output) {
            Ok(data) if data.is_empty() => {
                log.warn(component, format!("{}: {} stream is empty", source.name(), codec.name()));
                LoadOutcome::Keep
            }
            Ok(data) => {
                log.info(component, format!(
                    "{}: unpacked {} stream ({} -> {} bytes)",
                    source.name(), codec.name(), source.size(), data.len(),
                ));
                let name = derived_name(source.name(), codec);
                LoadOutcome::Replace(ByteSource::derived(source, self.name(), name, data))
            }
            Err(CodecError::TooLarge { limit }) => {
                log.error(component, format!(
                    "{}: {} stream expands beyond {limit} bytes, left packed",
                    source.name(), codec.name(),
                ));
                LoadOutcome::Keep
            }
            Err(e) => {
                log.warn(component, format!("{}: not a valid {} stream: {e}", source.name(), codec.name()));
                LoadOutcome::Keep
            }
        }
    }
}

/// `song.mid.zst` → `song.mid`; anything else gets a neutral suffix so the
/// derived source never claims an extension it does not have.
fn derived_name(name: &str, codec: CodecId) -> String {
    let suffixes: &[&str] = match codec {
        CodecId::Zstd => &[".zst", ".zstd"],
        CodecId::Lz4  => &[".lz4"],
        CodecId::Lzma => &[".lzma"],
    };
    let lower = name.to_lowercase();
    for suffix in suffixes {
        if lower.ends_with(suffix) {
            return name[..name.len() - suffix.len()].to_owned();
        }
    }
    format!("{name}#{}", codec.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, ZstdCodec, MAGIC_ZSTD};
    use crate::source::Origin;

    #[test]
    fn replaces_compressed_source() {
        let packed = ZstdCodec.compress(b"inner bytes", 3).unwrap();
        let src = ByteSource::from_bytes("track01.mid.zst", packed);
        let mut log = Diagnostics::new();
        match DecompressLoader::new(1 << 20).apply(&src, &mut log) {
            LoadOutcome::Replace(derived) => {
                assert_eq!(derived.as_slice(), b"inner bytes");
                assert_eq!(derived.name(), "track01.mid");
                assert_eq!(derived.extension(), "mid");
                assert!(matches!(derived.origin(), Origin::Derived { loader, .. } if loader == "decompress"));
            }
            LoadOutcome::Keep => panic!("expected replacement"),
        }
    }

    #[test]
    fn keeps_plain_and_broken_sources() {
        let loader = DecompressLoader::new(1 << 20);
        let mut log = Diagnostics::new();
        let plain = ByteSource::from_bytes("a.bin", b"plain data".to_vec());
        assert!(matches!(loader.apply(&plain, &mut log), LoadOutcome::Keep));
        assert!(log.is_empty());

        let mut broken = MAGIC_ZSTD.to_vec();
        broken.extend_from_slice(&[0xFF; 16]);
        let broken = ByteSource::from_bytes("b.bin", broken);
        assert!(matches!(loader.apply(&broken, &mut log), LoadOutcome::Keep));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn oversized_output_is_rejected() {
        let packed = ZstdCodec.compress(&vec![7u8; 4096], 3).unwrap();
        let src = ByteSource::from_bytes("big.zst", packed);
        let mut log = Diagnostics::new();
        assert!(matches!(DecompressLoader::new(100).apply(&src, &mut log), LoadOutcome::Keep));
        assert!(log.entries()[0].message.contains("beyond 100 bytes"));
    }
}
