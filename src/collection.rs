use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::diagnostics::Diagnostics;
use crate::export::{ExportError, StandardSequenceFile};
use crate::file::{FileId, FileKind, LogicalFile};
use crate::format::FormatRegistry;
use crate::matcher::Proposal;
use crate::source::{ByteSource, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CollectionId(pub(crate) u32);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coll#{}", self.0)
    }
}

/// Borrowed registry state a [`Collection::load`] needs.
pub struct LoadContext<'a> {
    pub files:     &'a mut BTreeMap<FileId, LogicalFile>,
    pub sources:   &'a BTreeMap<SourceId, ByteSource>,
    pub formats:   &'a FormatRegistry,
    pub max_steps: usize,
    pub log:       &'a mut Diagnostics,
}

/// One sequence together with the instrument, sample and misc files it
/// plays with.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    name:               String,
    sequence:           Option<FileId>,
    instrument_sets:    Vec<FileId>,
    sample_collections: Vec<FileId>,
    misc:               Vec<FileId>,
    loaded:             bool,
}

impl Collection {
    pub fn from_proposal(p: &Proposal) -> Self {
        Self {
            name:               p.name.clone(),
            sequence:           Some(p.sequence),
            instrument_sets:    p.instrument_sets.clone(),
            sample_collections: p.sample_collections.clone(),
            misc:               p.misc.clone(),
            loaded:             false,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn sequence(&self) -> Option<FileId> { self.sequence }
    pub fn instrument_sets(&self) -> &[FileId] { &self.instrument_sets }
    pub fn sample_collections(&self) -> &[FileId] { &self.sample_collections }
    pub fn misc(&self) -> &[FileId] { &self.misc }
    pub fn is_loaded(&self) -> bool { self.loaded }

    pub fn contains(&self, id: FileId) -> bool {
        self.sequence == Some(id)
            || self.instrument_sets.contains(&id)
            || self.sample_collections.contains(&id)
            || self.misc.contains(&id)
    }

    /// Drop `id` from the collection.  Returns `true` when it was the
    /// sequence, which leaves the collection unusable.
    pub(crate) fn detach(&mut self, id: FileId) -> bool {
        self.instrument_sets.retain(|f| *f != id);
        self.sample_collections.retain(|f| *f != id);
        self.misc.retain(|f| *f != id);
        if self.sequence == Some(id) {
            self.sequence = None;
            self.loaded = false;
            return true;
        }
        false
    }

    fn check_kind(&self, ctx: &mut LoadContext<'_>, ids: &[FileId], kind: FileKind) -> bool {
        for id in ids {
            match ctx.files.get(id) {
                Some(f) if f.kind() == kind => {}
                Some(f) => {
                    ctx.log.error("collection", format!(
                        "{}: {id} is a {:?}, expected {kind:?}", self.name, f.kind(),
                    ));
                    return false;
                }
                None => {
                    ctx.log.error("collection", format!("{}: {id} no longer exists", self.name));
                    return false;
                }
            }
        }
        true
    }

    /// Make the collection playable.
    ///
    /// Interprets the sequence if that has not happened yet and checks that
    /// every sample an instrument refers to is provided by one of the
    /// associated sample collections.  On `false` the caller must drop the
    /// collection; the reason is in the log.
    pub fn load(&mut self, ctx: &mut LoadContext<'_>) -> bool {
        let Some(seq_id) = self.sequence else {
            ctx.log.error("collection", format!("{}: no sequence assigned", self.name));
            return false;
        };
        if !self.check_kind(ctx, &[seq_id], FileKind::Sequence)
            || !self.check_kind(ctx, &self.instrument_sets, FileKind::InstrumentSet)
            || !self.check_kind(ctx, &self.sample_collections, FileKind::SampleCollection)
            || !self.check_kind(ctx, &self.misc, FileKind::Misc)
        {
            return false;
        }

        if !interpret_if_needed(seq_id, ctx) {
            ctx.log.error("collection", format!("{}: sequence {seq_id} cannot be interpreted", self.name));
            return false;
        }

        let available: usize = self
            .sample_collections
            .iter()
            .filter_map(|id| ctx.files.get(id)?.as_sample_collection())
            .map(|s| s.samples.len())
            .max()
            .unwrap_or(0);
        for id in &self.instrument_sets {
            let Some(set) = ctx.files.get(id).and_then(LogicalFile::as_instrument_set) else {
                continue;
            };
            if let Some(missing) = set.referenced_samples().into_iter().find(|&s| s as usize >= available) {
                ctx.log.error("collection", format!(
                    "{}: instrument set {id} uses sample {missing}, but only {available} sample(s) are associated",
                    self.name,
                ));
                return false;
            }
        }

        self.loaded = true;
        true
    }

    /// Flatten the sequence's timelines for serialization.
    pub fn to_standard_sequence_file(
        &self,
        files: &BTreeMap<FileId, LogicalFile>,
    ) -> Result<StandardSequenceFile, ExportError> {
        let id = self.sequence.ok_or_else(|| ExportError::NoSequence(self.name.clone()))?;
        let file = files.get(&id).ok_or(ExportError::UnknownFile(id))?;
        let seq = file.as_sequence().ok_or(ExportError::NotASequence(id))?;
        let mut smf = StandardSequenceFile::from_sequence(seq);
        smf.name = Some(self.name.clone());
        Ok(smf)
    }
}

fn interpret_if_needed(seq_id: FileId, ctx: &mut LoadContext<'_>) -> bool {
    let Some(file) = ctx.files.get_mut(&seq_id) else {
        return false;
    };
    let (source_id, format_name) = (file.source(), file.format());
    let Some(seq) = file.as_sequence_mut() else {
        return false;
    };
    if seq.is_interpreted() {
        return true;
    }
    let (Some(source), Some(format)) = (ctx.sources.get(&source_id), ctx.formats.get(format_name)) else {
        return false;
    };
    seq.interpret(format.as_ref(), source, ctx.max_steps, ctx.log);
    true
}
