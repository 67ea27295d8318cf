use serde::Serialize;

/// Absolute time in ticks (PPQN units) from the start of a track.
pub type Tick = u32;

/// Serialization rank of an event among events sharing a tick.
///
/// Variants are declared in output order: `Highest` events are written
/// before `Lowest` ones at the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Highest,
    Higher,
    High,
    Middle,
    /// Note-ons and note-offs share a rank so a zero-length note keeps its
    /// on before its off.
    Low,
    Lowest,
}

/// One abstract musical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventKind {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, value: u8 },
    /// Signed bend, -8192..=8191, 0 is centre.
    PitchBend { channel: u8, value: i16 },
    Tempo { micros_per_quarter: u32 },
    TimeSignature { numerator: u8, denominator_pow: u8, clocks_per_click: u8, notated_32nds: u8 },
    TrackName(String),
    Text(String),
    Marker(String),
    /// Payload after the `F0` status, including any trailing `F7`.
    SysEx(Vec<u8>),
    LoopStart,
    /// The track loops back here forever; interpretation stopped.
    LoopForever,
    /// Transposes every note of every track from this tick on.
    GlobalTranspose(i8),
    EndOfTrack,
}

impl EventKind {
    pub fn priority(&self) -> Priority {
        match self {
            EventKind::Tempo { .. }
            | EventKind::TimeSignature { .. }
            | EventKind::GlobalTranspose(_) => Priority::Highest,
            EventKind::TrackName(_)
            | EventKind::Text(_)
            | EventKind::Marker(_)
            | EventKind::LoopStart
            | EventKind::SysEx(_) => Priority::Higher,
            EventKind::ProgramChange { .. } => Priority::High,
            EventKind::Controller { .. }
            | EventKind::ChannelPressure { .. }
            | EventKind::PitchBend { .. } => Priority::Middle,
            EventKind::NoteOn { .. } | EventKind::NoteOff { .. } => Priority::Low,
            EventKind::LoopForever | EventKind::EndOfTrack => Priority::Lowest,
        }
    }

    /// File-scope events live in the global track of an export.
    pub fn is_global(&self) -> bool {
        matches!(self, EventKind::GlobalTranspose(_))
    }
}

/// An event placed on a track's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedEvent {
    pub tick:   Tick,
    pub kind:   EventKind,
    /// Offset of the opcode that produced the event, when there was one.
    pub offset: Option<usize>,
}
