//! Format plugins and their dispatch tables.
//!
//! A [`Format`] bundles everything the engine needs from one family of game
//! music data: a scanner, a track decoder and a matcher factory.  Formats are
//! registered by name in a [`FormatRegistry`]; the extensions they declare are
//! indexed in an [`ExtensionIndex`] so a source with a telling extension is
//! only offered to the scanners that claim it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::file::{FileBody, FileId, InstrumentSet, LogicalFile, SampleCollection};
use crate::matcher::{Matcher, SourceMatcher};
use crate::registry::RegistryError;
use crate::sequence::SequenceFile;
use crate::source::{ByteSource, SourceId};
use crate::track::{Step, Track, TrackError};

pub trait Format: Send + Sync {
    /// Unique name, also used as the diagnostics component.
    fn name(&self) -> &'static str;

    /// Lower-case file extensions that are only ever this format's.
    fn extensions(&self) -> &'static [&'static str] { &[] }

    /// One-time setup.  Returning `false` drops the format's scanner.
    fn init(&self) -> bool { true }

    /// Look for this format's files in `ctx.source()`.  Must not panic on
    /// malformed data; declining to add anything is the "no match" answer.
    fn scan(&self, ctx: &mut ScanContext<'_>);

    /// Decode one event at `track.cursor`.  Formats without sequences keep
    /// the default, which ends every track immediately.
    fn read_event(&self, source: &ByteSource, track: &mut Track) -> Result<Step, TrackError> {
        let _ = (source, track);
        Ok(Step::End)
    }

    /// Fresh grouping policy for this format's files.
    fn matcher(&self) -> Box<dyn Matcher> {
        Box::new(SourceMatcher::new())
    }
}

// ── ScanContext ───────────────────────────────────────────────────────────────

/// What a scanner sees: the source and a sink for the files it recognises.
pub struct ScanContext<'a> {
    source:    &'a ByteSource,
    source_id: SourceId,
    format:    &'static str,
    found:     Vec<LogicalFile>,
}

impl<'a> ScanContext<'a> {
    pub(crate) fn new(source: &'a ByteSource, source_id: SourceId, format: &'static str) -> Self {
        Self { source, source_id, format, found: Vec::new() }
    }

    pub fn source(&self) -> &'a ByteSource { self.source }

    pub fn found(&self) -> &[LogicalFile] { &self.found }

    pub(crate) fn into_found(self) -> Vec<LogicalFile> { self.found }

    fn add(&mut self, name: String, offset: usize, length: usize, body: FileBody) -> &mut LogicalFile {
        self.found.push(LogicalFile {
            id: FileId(u32::MAX),
            source: self.source_id,
            format: self.format,
            offset,
            length,
            provisional_length: false,
            name,
            match_id: None,
            body,
        });
        let last = self.found.len() - 1;
        &mut self.found[last]
    }

    pub fn add_sequence(
        &mut self,
        name: impl Into<String>,
        offset: usize,
        length: usize,
        sequence: SequenceFile,
    ) -> &mut LogicalFile {
        self.add(name.into(), offset, length, FileBody::Sequence(sequence))
    }

    pub fn add_instrument_set(
        &mut self,
        name: impl Into<String>,
        offset: usize,
        length: usize,
        set: InstrumentSet,
    ) -> &mut LogicalFile {
        self.add(name.into(), offset, length, FileBody::InstrumentSet(set))
    }

    pub fn add_sample_collection(
        &mut self,
        name: impl Into<String>,
        offset: usize,
        length: usize,
        samples: SampleCollection,
    ) -> &mut LogicalFile {
        self.add(name.into(), offset, length, FileBody::SampleCollection(samples))
    }

    pub fn add_misc(&mut self, name: impl Into<String>, offset: usize, length: usize) -> &mut LogicalFile {
        self.add(name.into(), offset, length, FileBody::Misc)
    }
}

// ── FormatRegistry ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
    by_name: HashMap<&'static str, usize>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, format: Arc<dyn Format>) -> Result<(), RegistryError> {
        let name = format.name();
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateFormat(name.to_owned()));
        }
        self.by_name.insert(name, self.formats.len());
        self.formats.push(format);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Format>> {
        self.by_name.get(name).map(|&i| &self.formats[i])
    }

    /// Formats in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Format>> {
        self.formats.iter()
    }

    pub fn len(&self) -> usize { self.formats.len() }
    pub fn is_empty(&self) -> bool { self.formats.is_empty() }
}

// ── ExtensionIndex ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ExtensionIndex {
    map: HashMap<String, Vec<&'static str>>,
}

fn normalize(ext: &str) -> String {
    ext.trim_start_matches('.').to_lowercase()
}

impl ExtensionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate(&mut self, ext: &str, format: &'static str) {
        let names = self.map.entry(normalize(ext)).or_default();
        if !names.contains(&format) {
            names.push(format);
        }
    }

    /// Formats claiming `ext`; empty when none do.
    pub fn scanners_for(&self, ext: &str) -> &[&'static str] {
        self.map.get(&normalize(ext)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forget `format` everywhere, e.g. after its `init` failed.
    pub fn remove_format(&mut self, format: &str) {
        for names in self.map.values_mut() {
            names.retain(|n| *n != format);
        }
        self.map.retain(|_, names| !names.is_empty());
    }
}
