//! Grouping policies that turn loose files into collection proposals.
//!
//! Every format owns one [`Matcher`].  The registry feeds it each new file of
//! that format, tells it when a source has been completely scanned and when a
//! file goes away, and turns the [`Proposal`]s it returns into collections.

use std::collections::BTreeMap;

use crate::file::{FileId, FileKind, LogicalFile};
use crate::source::{ByteSource, SourceId};

/// A candidate collection: one sequence plus the files it plays with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub name:               String,
    pub sequence:           FileId,
    pub instrument_sets:    Vec<FileId>,
    pub sample_collections: Vec<FileId>,
    pub misc:               Vec<FileId>,
}

impl Proposal {
    pub fn new(name: impl Into<String>, sequence: FileId) -> Self {
        Self {
            name: name.into(),
            sequence,
            instrument_sets: Vec::new(),
            sample_collections: Vec::new(),
            misc: Vec::new(),
        }
    }

    /// Every file of the proposal, sequence first.
    pub fn files(&self) -> impl Iterator<Item = FileId> + '_ {
        std::iter::once(self.sequence)
            .chain(self.instrument_sets.iter().copied())
            .chain(self.sample_collections.iter().copied())
            .chain(self.misc.iter().copied())
    }
}

pub trait Matcher: Send {
    fn on_new_file(&mut self, file: &LogicalFile, source: &ByteSource) -> Vec<Proposal>;

    fn on_close_file(&mut self, file: &LogicalFile);

    /// Called once all files found in `source` have been reported.
    fn on_source_scanned(&mut self, source: SourceId) -> Vec<Proposal> {
        let _ = source;
        Vec::new()
    }

    /// Last chance to veto a proposal, given its files in [`Proposal::files`] order.
    fn on_match(&self, files: &[&LogicalFile]) -> bool {
        let _ = files;
        true
    }
}

// ── SourceMatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Group {
    sequences:          Vec<(FileId, String)>,
    instrument_sets:    Vec<FileId>,
    sample_collections: Vec<FileId>,
    misc:               Vec<FileId>,
}

/// Groups every sequence with all instrument, sample and misc files found in
/// the same source.
#[derive(Debug, Default)]
pub struct SourceMatcher {
    groups: BTreeMap<SourceId, Group>,
}

impl SourceMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Matcher for SourceMatcher {
    fn on_new_file(&mut self, file: &LogicalFile, _: &ByteSource) -> Vec<Proposal> {
        let group = self.groups.entry(file.source()).or_default();
        match file.kind() {
            FileKind::Sequence         => group.sequences.push((file.id(), file.name.clone())),
            FileKind::InstrumentSet    => group.instrument_sets.push(file.id()),
            FileKind::SampleCollection => group.sample_collections.push(file.id()),
            FileKind::Misc             => group.misc.push(file.id()),
        }
        Vec::new()
    }

    fn on_close_file(&mut self, file: &LogicalFile) {
        if let Some(group) = self.groups.get_mut(&file.source()) {
            let id = file.id();
            group.sequences.retain(|(f, _)| *f != id);
            group.instrument_sets.retain(|f| *f != id);
            group.sample_collections.retain(|f| *f != id);
            group.misc.retain(|f| *f != id);
        }
    }

    fn on_source_scanned(&mut self, source: SourceId) -> Vec<Proposal> {
        let Some(group) = self.groups.remove(&source) else {
            return Vec::new();
        };
        group
            .sequences
            .into_iter()
            .map(|(seq, name)| Proposal {
                name,
                sequence: seq,
                instrument_sets: group.instrument_sets.clone(),
                sample_collections: group.sample_collections.clone(),
                misc: group.misc.clone(),
            })
            .collect()
    }
}

// ── Keyed matching ────────────────────────────────────────────────────────────

/// Pairs sequences with the instrument set (and optionally sample
/// collection) that carry the same key.
#[derive(Debug)]
struct Keyed<K: Ord + Clone> {
    sequences:       BTreeMap<K, Vec<(FileId, String)>>,
    instrument_sets: BTreeMap<K, FileId>,
    samples:         BTreeMap<K, FileId>,
    require_samples: bool,
}

impl<K: Ord + Clone> Keyed<K> {
    fn new(require_samples: bool) -> Self {
        Self {
            sequences: BTreeMap::new(),
            instrument_sets: BTreeMap::new(),
            samples: BTreeMap::new(),
            require_samples,
        }
    }

    fn insert(&mut self, key: K, file: &LogicalFile) -> Vec<Proposal> {
        match file.kind() {
            FileKind::Sequence => {
                self.sequences.entry(key.clone()).or_default().push((file.id(), file.name.clone()));
            }
            FileKind::InstrumentSet => {
                self.instrument_sets.insert(key.clone(), file.id());
            }
            FileKind::SampleCollection => {
                self.samples.insert(key.clone(), file.id());
            }
            FileKind::Misc => return Vec::new(),
        }
        self.try_match(&key)
    }

    fn try_match(&mut self, key: &K) -> Vec<Proposal> {
        let Some(&instr) = self.instrument_sets.get(key) else {
            return Vec::new();
        };
        let samples = self.samples.get(key).copied();
        if self.require_samples && samples.is_none() {
            return Vec::new();
        }
        let Some(seqs) = self.sequences.remove(key) else {
            return Vec::new();
        };
        seqs.into_iter()
            .map(|(seq, name)| Proposal {
                name,
                sequence: seq,
                instrument_sets: vec![instr],
                sample_collections: samples.into_iter().collect(),
                misc: Vec::new(),
            })
            .collect()
    }

    fn remove(&mut self, id: FileId) {
        for seqs in self.sequences.values_mut() {
            seqs.retain(|(f, _)| *f != id);
        }
        self.sequences.retain(|_, v| !v.is_empty());
        self.instrument_sets.retain(|_, f| *f != id);
        self.samples.retain(|_, f| *f != id);
    }
}

/// Matches files that share the id their headers embed
/// ([`LogicalFile::match_id`]).
#[derive(Debug)]
pub struct IdMatcher {
    inner: Keyed<u32>,
}

impl IdMatcher {
    pub fn new(require_samples: bool) -> Self {
        Self { inner: Keyed::new(require_samples) }
    }
}

impl Matcher for IdMatcher {
    fn on_new_file(&mut self, file: &LogicalFile, _: &ByteSource) -> Vec<Proposal> {
        match file.match_id {
            Some(id) => self.inner.insert(id, file),
            None => Vec::new(),
        }
    }

    fn on_close_file(&mut self, file: &LogicalFile) {
        self.inner.remove(file.id());
    }
}

/// Matches files whose sources share a file stem, e.g. `BGM01.SEQ` with
/// `BGM01.VAB`.
#[derive(Debug)]
pub struct FilenameMatcher {
    inner: Keyed<String>,
}

impl FilenameMatcher {
    pub fn new(require_samples: bool) -> Self {
        Self { inner: Keyed::new(require_samples) }
    }
}

impl Matcher for FilenameMatcher {
    fn on_new_file(&mut self, file: &LogicalFile, source: &ByteSource) -> Vec<Proposal> {
        self.inner.insert(source.stem().to_lowercase(), file)
    }

    fn on_close_file(&mut self, file: &LogicalFile) {
        self.inner.remove(file.id());
    }
}
