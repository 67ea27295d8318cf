//! Flattening interpreted sequences into Standard MIDI Files.
//!
//! A [`StandardSequenceFile`] is the export-side view of a
//! [`SequenceFile`]: one [`StandardTrack`] per decoder track plus a global
//! track for file-scope events.  [`StandardSequenceFile::to_bytes`] writes a
//! format-1 SMF through `midly`.  Events of a track are merged with the
//! global ones, sorted stably by [`Priority`] and then stably by tick, so
//! events that share both keep the order the decoder emitted them in.

pub mod vlq;

use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use thiserror::Error;

use crate::collection::CollectionId;
use crate::event::{EventKind, Priority, Tick};
use crate::file::FileId;
use crate::sequence::SequenceFile;

pub use vlq::{decode_vlq, encode_vlq, MAX_VLQ};

pub const LOOP_START_MARKER: &str = "loopStart";
pub const LOOP_END_MARKER:   &str = "loopEnd";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("collection '{0}' has no sequence")]
    NoSequence(String),
    #[error("{0} is not registered")]
    UnknownFile(FileId),
    #[error("{0} is not a sequence")]
    NotASequence(FileId),
    #[error("unknown collection {0}")]
    UnknownCollection(CollectionId),
    #[error("PPQN {0} does not fit a metrical SMF header")]
    InvalidPpqn(u16),
    #[error("{0} tracks do not fit an SMF header")]
    TooManyTracks(usize),
    #[error("delta of {delta} ticks before tick {tick} exceeds the variable-length maximum")]
    DeltaOverflow { tick: Tick, delta: u32 },
    #[error("failed to write MIDI: {0}")]
    Midi(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEvent {
    pub tick:     Tick,
    pub priority: Priority,
    pub payload:  EventKind,
}

impl StandardEvent {
    pub fn new(tick: Tick, payload: EventKind) -> Self {
        Self { tick, priority: payload.priority(), payload }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandardTrack {
    pub events: Vec<StandardEvent>,
    /// Earliest tick the end-of-track may be written at, so trailing rests
    /// survive.
    pub end:    Tick,
}

impl StandardTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tick: Tick, payload: EventKind) {
        self.events.push(StandardEvent::new(tick, payload));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardSequenceFile {
    /// Display name, e.g. the collection's.  Not serialized.
    pub name:   Option<String>,
    pub ppqn:   u16,
    pub tracks: Vec<StandardTrack>,
    /// File-scope events merged into every track on output.
    pub global: StandardTrack,
}

impl StandardSequenceFile {
    pub fn new(ppqn: u16) -> Self {
        Self { name: None, ppqn, tracks: Vec::new(), global: StandardTrack::new() }
    }

    /// Copy the timelines of `seq`.  Global events move to the global track;
    /// a named track gets its name as a tick-0 meta event.  Each track ends
    /// no earlier than the tick its decoder stopped at.
    pub fn from_sequence(seq: &SequenceFile) -> Self {
        let mut smf = Self::new(seq.ppqn);
        for track in &seq.tracks {
            let mut out = StandardTrack::new();
            out.end = track.tick();
            if let Some(name) = track.name() {
                out.push(0, EventKind::TrackName(name.to_owned()));
            }
            for e in track.timeline() {
                if e.kind.is_global() {
                    smf.global.push(e.tick, e.kind.clone());
                } else {
                    out.push(e.tick, e.kind.clone());
                }
            }
            smf.tracks.push(out);
        }
        smf
    }

    /// Events of track `index` in output order, global events included and
    /// end-of-track markers removed.
    pub fn ordered_events(&self, index: usize) -> Vec<&StandardEvent> {
        let mut merged: Vec<&StandardEvent> = self
            .tracks
            .get(index)
            .into_iter()
            .flat_map(|t| t.events.iter())
            .chain(self.global.events.iter())
            .filter(|e| e.payload != EventKind::EndOfTrack)
            .collect();
        merged.sort_by_key(|e| e.priority);
        merged.sort_by_key(|e| e.tick);
        merged
    }

    /// Serialize as a format-1 Standard MIDI File.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ExportError> {
        if self.ppqn == 0 || self.ppqn >= 0x8000 {
            return Err(ExportError::InvalidPpqn(self.ppqn));
        }
        if self.tracks.len() > usize::from(u16::MAX) {
            return Err(ExportError::TooManyTracks(self.tracks.len()));
        }

        let tracks = (0..self.tracks.len())
            .map(|index| self.build_track(index))
            .collect::<Result<Vec<_>, _>>()?;

        let header = Header {
            format: Format::Parallel,
            timing: Timing::Metrical(u15::new(self.ppqn)),
        };
        let smf = Smf { header, tracks };

        let mut out = Vec::new();
        smf.write(&mut out).map_err(|e| ExportError::Midi(e.to_string()))?;
        Ok(out)
    }

    fn build_track(&self, index: usize) -> Result<Vec<TrackEvent<'_>>, ExportError> {
        let track = &self.tracks[index];
        let own_end = track
            .events
            .iter()
            .filter(|e| e.payload == EventKind::EndOfTrack)
            .map(|e| e.tick)
            .fold(track.end, Tick::max);

        let mut b = TrackBuilder::default();
        for e in self.ordered_events(index) {
            b.event(e)?;
        }
        b.end_of_track(own_end)?;
        Ok(b.events)
    }
}

// ── Event conversion ──────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackBuilder<'a> {
    events:    Vec<TrackEvent<'a>>,
    last_tick: Tick,
    transpose: i32,
    /// Keys actually written for notes still sounding, per (channel, key).
    sounding:  HashMap<(u8, u8), Vec<u8>>,
}

impl<'a> TrackBuilder<'a> {
    fn push(&mut self, tick: Tick, kind: TrackEventKind<'a>) -> Result<(), ExportError> {
        let delta = tick.saturating_sub(self.last_tick);
        if delta > MAX_VLQ {
            return Err(ExportError::DeltaOverflow { tick, delta });
        }
        self.events.push(TrackEvent { delta: u28::new(delta), kind });
        self.last_tick = self.last_tick.max(tick);
        Ok(())
    }

    fn transposed(&self, key: u8) -> u8 {
        (i32::from(key) + self.transpose).clamp(0, 127) as u8
    }

    fn midi(channel: u8, message: MidiMessage) -> TrackEventKind<'a> {
        TrackEventKind::Midi { channel: u4::new(channel & 0x0F), message }
    }

    fn event(&mut self, e: &'a StandardEvent) -> Result<(), ExportError> {
        let kind = match &e.payload {
            &EventKind::GlobalTranspose(semitones) => {
                self.transpose = i32::from(semitones);
                return Ok(());
            }
            EventKind::EndOfTrack => return Ok(()),
            &EventKind::NoteOn { channel, key, velocity } => {
                let out = self.transposed(key);
                self.sounding.entry((channel, key)).or_default().push(out);
                Self::midi(channel, MidiMessage::NoteOn { key: u7::new(out), vel: u7::new(velocity) })
            }
            &EventKind::NoteOff { channel, key } => {
                let held = self
                    .sounding
                    .get_mut(&(channel, key))
                    .and_then(|keys| (!keys.is_empty()).then(|| keys.remove(0)));
                let out = held.unwrap_or_else(|| self.transposed(key));
                Self::midi(channel, MidiMessage::NoteOff { key: u7::new(out), vel: u7::new(0x40) })
            }
            &EventKind::Controller { channel, controller, value } => Self::midi(
                channel,
                MidiMessage::Controller { controller: u7::new(controller), value: u7::new(value) },
            ),
            &EventKind::ProgramChange { channel, program } => {
                Self::midi(channel, MidiMessage::ProgramChange { program: u7::new(program) })
            }
            &EventKind::ChannelPressure { channel, value } => {
                Self::midi(channel, MidiMessage::ChannelAftertouch { vel: u7::new(value) })
            }
            &EventKind::PitchBend { channel, value } => {
                Self::midi(channel, MidiMessage::PitchBend { bend: PitchBend::from_int(value) })
            }
            &EventKind::Tempo { micros_per_quarter } => {
                TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_quarter.min(0x00FF_FFFF))))
            }
            &EventKind::TimeSignature { numerator, denominator_pow, clocks_per_click, notated_32nds } => {
                TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, denominator_pow, clocks_per_click, notated_32nds))
            }
            EventKind::Text(text)      => TrackEventKind::Meta(MetaMessage::Text(text.as_bytes())),
            EventKind::TrackName(name) => TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes())),
            EventKind::Marker(text)    => TrackEventKind::Meta(MetaMessage::Marker(text.as_bytes())),
            EventKind::LoopStart       => TrackEventKind::Meta(MetaMessage::Marker(LOOP_START_MARKER.as_bytes())),
            EventKind::LoopForever     => TrackEventKind::Meta(MetaMessage::Marker(LOOP_END_MARKER.as_bytes())),
            EventKind::SysEx(data)     => TrackEventKind::SysEx(data.as_slice()),
        };
        self.push(e.tick, kind)
    }

    fn end_of_track(&mut self, decoder_end: Tick) -> Result<(), ExportError> {
        self.push(self.last_tick.max(decoder_end), TrackEventKind::Meta(MetaMessage::EndOfTrack))
    }
}
