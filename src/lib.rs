pub mod source;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod loader;
pub mod event;
pub mod track;
pub mod sequence;
pub mod file;
pub mod format;
pub mod matcher;
pub mod collection;
pub mod export;
pub mod formats;
pub mod registry;

pub use source::{ByteSource, Endian, Pattern, SourceError, SourceId};
pub use config::RegistryConfig;
pub use diagnostics::{Diagnostics, LogEntry, Severity};
pub use loader::{DecompressLoader, LoadOutcome, Loader};
pub use event::{EventKind, Priority, Tick, TimedEvent};
pub use track::{Step, Track, TrackError, TrackOutcome};
pub use sequence::SequenceFile;
pub use file::{FileId, FileKind, LogicalFile};
pub use format::{ExtensionIndex, Format, FormatRegistry, ScanContext};
pub use matcher::{FilenameMatcher, IdMatcher, Matcher, Proposal, SourceMatcher};
pub use collection::{Collection, CollectionId};
pub use export::{ExportError, StandardEvent, StandardSequenceFile, StandardTrack};
pub use registry::{Registry, RegistryError};
