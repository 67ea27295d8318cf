use serde::Serialize;
use std::fmt;

use crate::sequence::SequenceFile;
use crate::source::SourceId;

/// Opaque handle of a [`LogicalFile`] registered in a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FileId(pub(crate) u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileKind {
    Sequence,
    InstrumentSet,
    SampleCollection,
    Misc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instrument {
    pub bank:    u32,
    pub program: u32,
    /// Indices into the samples of an associated [`SampleCollection`].
    pub samples: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentSet {
    pub instruments: Vec<Instrument>,
}

impl InstrumentSet {
    /// Every sample index referenced by any instrument, ascending, unique.
    pub fn referenced_samples(&self) -> Vec<u32> {
        let mut refs: Vec<u32> = self.instruments.iter().flat_map(|i| i.samples.iter().copied()).collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub offset: usize,
    pub length: usize,
    pub name:   String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleCollection {
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone)]
pub enum FileBody {
    Sequence(SequenceFile),
    InstrumentSet(InstrumentSet),
    SampleCollection(SampleCollection),
    Misc,
}

// ── LogicalFile ───────────────────────────────────────────────────────────────

/// A region of a [`ByteSource`](crate::source::ByteSource) recognised by a scanner.
#[derive(Debug, Clone)]
pub struct LogicalFile {
    pub(crate) id:     FileId,
    pub(crate) source: SourceId,
    pub(crate) format: &'static str,
    pub offset:   usize,
    pub length:   usize,
    /// Length is a guess until the sequence has been interpreted.
    pub provisional_length: bool,
    pub name:     String,
    /// Identifier shared with related files, for id-based matching.
    pub match_id: Option<u32>,
    pub body:     FileBody,
}

impl LogicalFile {
    pub fn id(&self) -> FileId { self.id }
    pub fn source(&self) -> SourceId { self.source }
    pub fn format(&self) -> &'static str { self.format }

    pub fn kind(&self) -> FileKind {
        match self.body {
            FileBody::Sequence(_)         => FileKind::Sequence,
            FileBody::InstrumentSet(_)    => FileKind::InstrumentSet,
            FileBody::SampleCollection(_) => FileKind::SampleCollection,
            FileBody::Misc                => FileKind::Misc,
        }
    }

    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.length)
    }

    pub fn as_sequence(&self) -> Option<&SequenceFile> {
        match &self.body {
            FileBody::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence_mut(&mut self) -> Option<&mut SequenceFile> {
        match &mut self.body {
            FileBody::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instrument_set(&self) -> Option<&InstrumentSet> {
        match &self.body {
            FileBody::InstrumentSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sample_collection(&self) -> Option<&SampleCollection> {
        match &self.body {
            FileBody::SampleCollection(s) => Some(s),
            _ => None,
        }
    }
}
