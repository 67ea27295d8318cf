//! Addressable, bounds-checked byte containers.
//!
//! A [`ByteSource`] is either read from disk, built from memory, or derived
//! from another source by a [`Loader`](crate::loader::Loader).  Every read is
//! bounds-checked and fails with [`SourceError::OutOfBounds`] rather than
//! panicking, so format decoders can propagate bad offsets with `?`.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("read of {len} byte(s) at 0x{offset:X} is outside source of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("invalid byte pattern: {0}")]
    InvalidPattern(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Byte order of a multi-byte read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Opaque handle of a source registered in a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub(crate) u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

/// Where a source's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    File(PathBuf),
    Memory,
    /// Produced by `loader` from the source called `parent`.
    Derived { parent: String, loader: String },
}

// ── ByteSource ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ByteSource {
    name:     String,
    data:     Vec<u8>,
    origin:   Origin,
    loadable: bool,
}

impl ByteSource {
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { name: name.into(), data, origin: Origin::Memory, loadable: true }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, data, origin: Origin::File(path.to_owned()), loadable: true })
    }

    /// Build a source derived from `parent` by the loader called `loader`.
    pub fn derived(parent: &ByteSource, loader: &str, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            origin: Origin::Derived { parent: parent.name.clone(), loader: loader.to_owned() },
            loadable: true,
        }
    }

    /// Opt this source out of any further loader processing.
    pub fn without_loaders(mut self) -> Self {
        self.loadable = false;
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn origin(&self) -> &Origin { &self.origin }
    pub fn is_loadable(&self) -> bool { self.loadable }
    pub fn as_slice(&self) -> &[u8] { &self.data }

    pub fn size(&self) -> usize { self.data.len() }

    /// Lower-cased extension of the source name, without the dot.
    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    /// Source name with its extension stripped.
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(dot) if dot > 0 => &self.name[..dot],
            _ => &self.name,
        }
    }

    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    pub fn contains_range(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.data.len())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn bytes(&self, offset: usize, count: usize) -> Result<&[u8], SourceError> {
        if !self.contains_range(offset, count) {
            return Err(SourceError::OutOfBounds { offset, len: count, size: self.data.len() });
        }
        Ok(&self.data[offset..offset + count])
    }

    pub fn byte(&self, offset: usize) -> Result<u8, SourceError> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn short(&self, offset: usize, endian: Endian) -> Result<u16, SourceError> {
        let b = self.bytes(offset, 2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big    => BigEndian::read_u16(b),
        })
    }

    pub fn word(&self, offset: usize, endian: Endian) -> Result<u32, SourceError> {
        let b = self.bytes(offset, 4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big    => BigEndian::read_u32(b),
        })
    }

    /// Big-endian 24-bit read, as used by tempo fields.
    pub fn triple_be(&self, offset: usize) -> Result<u32, SourceError> {
        Ok(BigEndian::read_u24(self.bytes(offset, 3)?))
    }

    /// First offset at or after `from` where `pattern` matches.
    pub fn search_pattern(&self, pattern: &Pattern, from: usize) -> Option<usize> {
        let n = pattern.len();
        if n == 0 || n > self.data.len() {
            return None;
        }
        (from..=self.data.len() - n).find(|&off| pattern.matches(&self.data[off..off + n]))
    }
}

// ── Pattern ───────────────────────────────────────────────────────────────────

/// Fixed-byte / wildcard byte pattern.
///
/// The textual form is whitespace-separated hex bytes, with `??` marking a
/// wildcard: `"4D 54 68 64 ?? ?? 00 06"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    mask:  Vec<bool>,
}

impl Pattern {
    pub fn exact(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec(), mask: vec![true; bytes.len()] }
    }

    pub fn parse(text: &str) -> Result<Self, SourceError> {
        let mut bytes = Vec::new();
        let mut mask  = Vec::new();
        for token in text.split_whitespace() {
            if token == "??" {
                bytes.push(0);
                mask.push(false);
                continue;
            }
            let decoded = hex::decode(token)
                .map_err(|e| SourceError::InvalidPattern(format!("'{token}': {e}")))?;
            if decoded.len() != 1 {
                return Err(SourceError::InvalidPattern(format!("'{token}' is not a single byte")));
            }
            bytes.push(decoded[0]);
            mask.push(true);
        }
        Ok(Self { bytes, mask })
    }

    pub fn len(&self) -> usize { self.bytes.len() }
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.bytes.len()
            && window
                .iter()
                .zip(self.bytes.iter().zip(&self.mask))
                .all(|(b, (p, fixed))| !fixed || b == p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let src = ByteSource::from_bytes("a.bin", vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(src.short(0, Endian::Big).unwrap(), 0x1234);
        assert_eq!(src.short(0, Endian::Little).unwrap(), 0x3412);
        assert_eq!(src.word(0, Endian::Big).unwrap(), 0x1234_5678);
        assert_eq!(src.triple_be(1).unwrap(), 0x34_5678);
        assert!(matches!(src.word(1, Endian::Big), Err(SourceError::OutOfBounds { offset: 1, len: 4, size: 4 })));
        assert!(src.bytes(usize::MAX, 2).is_err());
    }

    #[test]
    fn wildcard_search() {
        let src = ByteSource::from_bytes("x", b"..MThd\x00\x00\x00\x06..".to_vec());
        let pat = Pattern::parse("4D ?? 68 64").unwrap();
        assert_eq!(src.search_pattern(&pat, 0), Some(2));
        assert_eq!(src.search_pattern(&pat, 3), None);
        assert!(Pattern::parse("4D5").is_err());
        assert!(Pattern::parse("zz").is_err());
    }

    #[test]
    fn extension_and_stem() {
        let src = ByteSource::from_bytes("Music.SEQ", Vec::new());
        assert_eq!(src.extension(), "seq");
        assert_eq!(src.stem(), "Music");
        assert_eq!(ByteSource::from_bytes("noext", Vec::new()).extension(), "");
    }
}
