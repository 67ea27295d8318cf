//! The [`Registry`]: the explicit context every pipeline call goes through.
//!
//! ```no_run
//! use seqdump::{Registry, RegistryConfig};
//!
//! let mut reg = Registry::with_builtin(RegistryConfig::default())?;
//! reg.open_file("bgm.seq")?;
//! for (id, coll) in reg.collections() {
//!     let bytes = reg.export(id)?.to_bytes()?;
//!     std::fs::write(format!("{}.mid", coll.name()), bytes)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! `open` runs the loaders, hands the resulting source to the scanners the
//! extension index selects (or every active scanner), interprets the
//! sequences found, feeds each file to its format's matcher and registers the
//! collections that load.  Sources, files and collections are kept in ordered
//! maps keyed by ids that are never reused, so iteration order equals
//! registration order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::collection::{Collection, CollectionId, LoadContext};
use crate::config::RegistryConfig;
use crate::diagnostics::{Diagnostics, Severity};
use crate::export::{ExportError, StandardSequenceFile};
use crate::file::{FileId, LogicalFile};
use crate::format::{ExtensionIndex, Format, FormatRegistry, ScanContext};
use crate::formats;
use crate::loader::{DecompressLoader, LoadOutcome, Loader};
use crate::matcher::{Matcher, Proposal};
use crate::source::{ByteSource, SourceError, SourceId};

const COMPONENT: &str = "registry";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("format '{0}' is already registered")]
    DuplicateFormat(String),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}

pub struct Registry {
    config:      RegistryConfig,
    formats:     FormatRegistry,
    extensions:  ExtensionIndex,
    loaders:     Vec<Box<dyn Loader>>,
    /// Formats whose scanners run, in registration order.
    active:      Vec<&'static str>,
    matchers:    BTreeMap<&'static str, Box<dyn Matcher>>,
    sources:     BTreeMap<SourceId, ByteSource>,
    files:       BTreeMap<FileId, LogicalFile>,
    collections: BTreeMap<CollectionId, Collection>,
    next_source:     u32,
    next_file:       u32,
    next_collection: u32,
    log:         Diagnostics,
}

impl Registry {
    /// Build a registry from explicit format and loader lists.
    ///
    /// Formats disabled by `config` or whose `init` fails are kept for
    /// lookup but never scan.
    pub fn new(
        config:  RegistryConfig,
        formats: Vec<Arc<dyn Format>>,
        loaders: Vec<Box<dyn Loader>>,
    ) -> Result<Self, RegistryError> {
        let mut reg = Registry {
            config,
            formats:     FormatRegistry::new(),
            extensions:  ExtensionIndex::new(),
            loaders,
            active:      Vec::new(),
            matchers:    BTreeMap::new(),
            sources:     BTreeMap::new(),
            files:       BTreeMap::new(),
            collections: BTreeMap::new(),
            next_source:     0,
            next_file:       0,
            next_collection: 0,
            log:         Diagnostics::new(),
        };
        for format in formats {
            reg.formats.register(Arc::clone(&format))?;
            for ext in format.extensions() {
                reg.extensions.associate(ext, format.name());
            }
            reg.matchers.insert(format.name(), format.matcher());
        }
        for format in reg.formats.iter() {
            let name = format.name();
            if reg.config.is_disabled(name) {
                reg.log.info(COMPONENT, format!("format '{name}' disabled by configuration"));
                reg.extensions.remove_format(name);
            } else if !format.init() {
                reg.log.push(Severity::Debug, COMPONENT, format!("format '{name}' failed to initialise"));
                reg.extensions.remove_format(name);
            } else {
                reg.active.push(name);
            }
        }
        Ok(reg)
    }

    /// Registry with every built-in format and the decompressing loader.
    pub fn with_builtin(config: RegistryConfig) -> Result<Self, RegistryError> {
        let loader = DecompressLoader::new(config.max_derived_size);
        Self::new(config, formats::builtin(), vec![Box::new(loader)])
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Option<SourceId>, RegistryError> {
        let source = ByteSource::from_file(path)?;
        Ok(self.open(source))
    }

    /// Run `source` through the pipeline.  `None` when nothing in it was
    /// recognised, in which case it is not kept.
    pub fn open(&mut self, source: ByteSource) -> Option<SourceId> {
        let source = self.run_loaders(source);
        self.scan(source)
    }

    fn run_loaders(&mut self, mut source: ByteSource) -> ByteSource {
        let mut depth = 0;
        'restart: while source.is_loadable() {
            for loader in &self.loaders {
                let LoadOutcome::Replace(derived) = loader.apply(&source, &mut self.log) else {
                    continue;
                };
                if depth >= self.config.max_loader_depth {
                    self.log.warn(COMPONENT, format!(
                        "{}: loaders nested deeper than {}, scanning as-is",
                        source.name(), self.config.max_loader_depth,
                    ));
                    break 'restart;
                }
                depth += 1;
                source = derived;
                continue 'restart;
            }
            break;
        }
        source
    }

    fn scan(&mut self, source: ByteSource) -> Option<SourceId> {
        let id = SourceId(self.next_source);
        let claimed = self.extensions.scanners_for(&source.extension());
        let scanners: Vec<&'static str> = if claimed.is_empty() {
            self.active.clone()
        } else {
            claimed.to_vec()
        };

        let mut found = Vec::new();
        for name in scanners {
            let Some(format) = self.formats.get(name) else { continue };
            let mut ctx = ScanContext::new(&source, id, format.name());
            format.scan(&mut ctx);
            found.extend(ctx.into_found());
        }

        let mut accepted = Vec::new();
        for mut file in found {
            self.finish_file(&source, &mut file);
            if source.contains_range(file.offset, file.length) {
                accepted.push(file);
            } else {
                self.log.error(COMPONENT, format!(
                    "{}: {} file '{}' at 0x{:X}+0x{:X} lies outside the source ({} bytes), discarded",
                    source.name(), file.format(), file.name, file.offset, file.length, source.size(),
                ));
            }
        }
        if accepted.is_empty() {
            self.log.push(Severity::Debug, COMPONENT, format!("{}: no known data", source.name()));
            return None;
        }

        self.next_source += 1;
        self.log.info(COMPONENT, format!(
            "{}: {} file(s) found, crc32 {:08x}",
            source.name(), accepted.len(), source.checksum(),
        ));

        let mut proposals: Vec<(&'static str, Proposal)> = Vec::new();
        let mut ids = Vec::with_capacity(accepted.len());
        for mut file in accepted {
            file.id = FileId(self.next_file);
            self.next_file += 1;
            if let Some(matcher) = self.matchers.get_mut(file.format()) {
                proposals.extend(matcher.on_new_file(&file, &source).into_iter().map(|p| (file.format(), p)));
            }
            ids.push(file.id);
            self.files.insert(file.id, file);
        }
        self.sources.insert(id, source);
        for (&name, matcher) in self.matchers.iter_mut() {
            proposals.extend(matcher.on_source_scanned(id).into_iter().map(|p| (name, p)));
        }

        for (format, proposal) in proposals {
            self.register_proposal(format, proposal);
        }
        Some(id)
    }

    /// Interpret a sequence right after its scan and settle a provisional
    /// length from how far its tracks read.
    fn finish_file(&mut self, source: &ByteSource, file: &mut LogicalFile) {
        let Some(format) = self.formats.get(file.format()).cloned() else { return };
        let offset = file.offset;
        let Some(seq) = file.as_sequence_mut() else { return };
        seq.interpret(format.as_ref(), source, self.config.max_track_steps, &mut self.log);
        let extent = seq.extent();
        if file.provisional_length {
            file.length = extent.saturating_sub(offset).max(file.length);
            file.provisional_length = false;
        }
    }

    fn register_proposal(&mut self, format: &'static str, proposal: Proposal) {
        let files: Vec<&LogicalFile> = proposal.files().filter_map(|id| self.files.get(&id)).collect();
        if files.len() != proposal.files().count() {
            self.log.error(COMPONENT, format!("{}: proposal refers to unknown files", proposal.name));
            return;
        }
        let vetoed = self.matchers.get(format).is_some_and(|m| !m.on_match(&files));
        if vetoed {
            self.log.info(&format!("matcher/{format}"), format!("{}: match vetoed", proposal.name));
            return;
        }

        let mut collection = Collection::from_proposal(&proposal);
        let mut ctx = LoadContext {
            files:     &mut self.files,
            sources:   &self.sources,
            formats:   &self.formats,
            max_steps: self.config.max_track_steps,
            log:       &mut self.log,
        };
        if !collection.load(&mut ctx) {
            self.log.warn(COMPONENT, format!("{}: collection dropped", proposal.name));
            return;
        }
        let id = CollectionId(self.next_collection);
        self.next_collection += 1;
        self.log.info(COMPONENT, format!("{id}: '{}' registered", collection.name()));
        self.collections.insert(id, collection);
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Drop a file, detaching it from every collection.  A collection whose
    /// sequence it was goes with it.
    pub fn remove_file(&mut self, id: FileId) -> Option<LogicalFile> {
        let file = self.files.remove(&id)?;
        if let Some(matcher) = self.matchers.get_mut(file.format()) {
            matcher.on_close_file(&file);
        }
        let mut orphaned = Vec::new();
        for (&cid, coll) in self.collections.iter_mut() {
            if coll.contains(id) && coll.detach(id) {
                orphaned.push(cid);
            }
        }
        for cid in orphaned {
            if let Some(coll) = self.collections.remove(&cid) {
                self.log.info(COMPONENT, format!("{cid}: '{}' lost its sequence, removed", coll.name()));
            }
        }
        Some(file)
    }

    /// Close a source together with every file found in it.
    pub fn close_source(&mut self, id: SourceId) -> Option<ByteSource> {
        let source = self.sources.remove(&id)?;
        let owned: Vec<FileId> = self.files.values().filter(|f| f.source() == id).map(LogicalFile::id).collect();
        for fid in owned {
            self.remove_file(fid);
        }
        self.log.info(COMPONENT, format!("{}: closed", source.name()));
        Some(source)
    }

    /// Close every source.  Matchers start over from a clean state.
    pub fn reset(&mut self) {
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.close_source(id);
        }
        self.matchers = self.formats.iter().map(|f| (f.name(), f.matcher())).collect();
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn config(&self) -> &RegistryConfig { &self.config }
    pub fn formats(&self) -> &FormatRegistry { &self.formats }
    pub fn active_formats(&self) -> &[&'static str] { &self.active }
    pub fn log(&self) -> &Diagnostics { &self.log }

    pub fn sources(&self) -> impl Iterator<Item = (SourceId, &ByteSource)> {
        self.sources.iter().map(|(&id, s)| (id, s))
    }

    pub fn source(&self, id: SourceId) -> Option<&ByteSource> {
        self.sources.get(&id)
    }

    pub fn files(&self) -> impl Iterator<Item = &LogicalFile> {
        self.files.values()
    }

    pub fn file(&self, id: FileId) -> Option<&LogicalFile> {
        self.files.get(&id)
    }

    pub fn collections(&self) -> impl Iterator<Item = (CollectionId, &Collection)> {
        self.collections.iter().map(|(&id, c)| (id, c))
    }

    pub fn collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    /// Flatten a registered collection for serialization.  Never
    /// re-interprets.
    pub fn export(&self, id: CollectionId) -> Result<StandardSequenceFile, ExportError> {
        let coll = self.collections.get(&id).ok_or(ExportError::UnknownCollection(id))?;
        coll.to_standard_sequence_file(&self.files)
    }
}
