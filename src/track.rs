//! Per-channel bytecode interpretation.
//!
//! A [`Track`] owns the running state of one decoder pass (cursor, tick,
//! running status, call stack, loop frames) and the [`TimedEvent`] timeline it
//! produces.  Format decoders only ever see the primitive `emit_*` /
//! `advance_time` calls and the bounds-checked `read_*` helpers; the halting
//! logic lives here in [`Track::interpret`].
//!
//! # Halting rule
//! Before every step the track records a visit key made of the cursor, the
//! call stack, the open loop frames and the decoder's `loop_state`.  Reaching a
//! key a second time means the decoder would repeat itself with nothing new to
//! tell apart the iterations, so interpretation stops and one
//! [`EventKind::LoopForever`] marker is appended.  Decoders with counters that
//! live outside the bytecode must fold them into `loop_state`, otherwise
//! finite repeats are cut short on their first revisit.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::event::{EventKind, TimedEvent, Tick};
use crate::export::decode_vlq;
use crate::source::{ByteSource, SourceError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("unknown opcode 0x{opcode:02X} at 0x{offset:X}")]
    UnknownOpcode { offset: usize, opcode: u8 },
    #[error("read of {len} byte(s) at 0x{offset:X} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    #[error("return without a matching call at 0x{offset:X}")]
    StackUnderflow { offset: usize },
    #[error("malformed data at 0x{offset:X}: {reason}")]
    Malformed { offset: usize, reason: String },
}

impl From<SourceError> for TrackError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::OutOfBounds { offset, len, .. } => TrackError::OutOfBounds { offset, len },
            other => TrackError::Malformed { offset: 0, reason: other.to_string() },
        }
    }
}

/// What a decoder wants after decoding one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    End,
}

/// How the last interpretation pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Completed,
    /// The cursor came back to an already visited state at `offset`.
    LoopedForever { offset: usize },
    /// The step budget ran out.
    Exhausted { steps: usize },
    Failed(TrackError),
}

impl TrackOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TrackOutcome::Failed(_) | TrackOutcome::Exhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoopFrame {
    start:     usize,
    /// Passes still to play after the current one; `None` loops forever.
    remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VisitKey {
    cursor:     usize,
    call_stack: Vec<usize>,
    loops:      Vec<LoopFrame>,
    loop_state: u64,
}

// ── Track ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Track {
    start:   usize,
    end:     Option<usize>,
    name:    Option<String>,
    /// Channel the decoder targets when the bytecode does not say otherwise.
    pub channel: u8,
    initial: Vec<EventKind>,

    // Running state, cleared by `reset`.
    pub cursor:         usize,
    /// Last channel-message status byte, for running-status formats.
    pub running_status: Option<u8>,
    /// Decoder-defined state that tells otherwise identical visits apart.
    pub loop_state:     u64,
    tick:       Tick,
    call_stack: Vec<usize>,
    loops:      Vec<LoopFrame>,
    timeline:   Vec<TimedEvent>,
    visited:    HashSet<VisitKey>,
    pending:    HashMap<(u8, u8), usize>,
    step_offset: Option<usize>,
    furthest:   usize,
    outcome:    Option<TrackOutcome>,
}

impl Track {
    pub fn new(start: usize) -> Self {
        Self {
            start,
            end: None,
            name: None,
            channel: 0,
            initial: Vec::new(),
            cursor: start,
            running_status: None,
            loop_state: 0,
            tick: 0,
            call_stack: Vec::new(),
            loops: Vec::new(),
            timeline: Vec::new(),
            visited: HashSet::new(),
            pending: HashMap::new(),
            step_offset: None,
            furthest: start,
            outcome: None,
        }
    }

    /// Reads past `end` fail with [`TrackError::OutOfBounds`].
    pub fn with_end(mut self, end: usize) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel & 0x0F;
        self
    }

    /// Queue an event replayed at tick 0 at the start of every pass.
    pub fn with_initial_event(mut self, kind: EventKind) -> Self {
        self.initial.push(kind);
        self
    }

    pub fn start(&self) -> usize { self.start }
    pub fn end(&self) -> Option<usize> { self.end }
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn tick(&self) -> Tick { self.tick }
    pub fn timeline(&self) -> &[TimedEvent] { &self.timeline }
    pub fn outcome(&self) -> Option<&TrackOutcome> { self.outcome.as_ref() }
    /// One past the last byte any pass has read.
    pub fn furthest(&self) -> usize { self.furthest }

    /// Clear all running state so the track can be interpreted again.
    pub fn reset(&mut self) {
        self.cursor = self.start;
        self.running_status = None;
        self.loop_state = 0;
        self.tick = 0;
        self.call_stack.clear();
        self.loops.clear();
        self.timeline.clear();
        self.visited.clear();
        self.pending.clear();
        self.step_offset = None;
        self.furthest = self.start;
        self.outcome = None;
        let initial = std::mem::take(&mut self.initial);
        for kind in &initial {
            self.push(kind.clone());
        }
        self.initial = initial;
    }

    // ── Interpretation ───────────────────────────────────────────────────────

    /// Run `step` until it ends the track, fails, loops forever, or has been
    /// called `max_steps` times.  Always starts from a fresh [`reset`](Self::reset).
    pub fn interpret<F>(&mut self, max_steps: usize, mut step: F) -> TrackOutcome
    where
        F: FnMut(&mut Track) -> Result<Step, TrackError>,
    {
        self.reset();
        let mut steps = 0usize;
        let outcome = loop {
            let key = VisitKey {
                cursor:     self.cursor,
                call_stack: self.call_stack.clone(),
                loops:      self.loops.clone(),
                loop_state: self.loop_state,
            };
            if !self.visited.insert(key) {
                self.step_offset = Some(self.cursor);
                self.push(EventKind::LoopForever);
                break TrackOutcome::LoopedForever { offset: self.cursor };
            }
            if steps >= max_steps {
                break TrackOutcome::Exhausted { steps };
            }
            steps += 1;
            self.step_offset = Some(self.cursor);
            match step(self) {
                Ok(Step::Continue) => {}
                Ok(Step::End)      => break TrackOutcome::Completed,
                Err(e)             => break TrackOutcome::Failed(e),
            }
        };
        self.step_offset = None;
        self.outcome = Some(outcome.clone());
        outcome
    }

    // ── Bytecode access ──────────────────────────────────────────────────────

    fn check_bound(&self, offset: usize, len: usize) -> Result<(), TrackError> {
        match self.end {
            Some(end) if offset.saturating_add(len) > end => Err(TrackError::OutOfBounds { offset, len }),
            _ => Ok(()),
        }
    }

    fn advance_cursor(&mut self, len: usize) {
        self.cursor += len;
        self.furthest = self.furthest.max(self.cursor);
    }

    pub fn peek_u8(&self, source: &ByteSource) -> Result<u8, TrackError> {
        self.check_bound(self.cursor, 1)?;
        Ok(source.byte(self.cursor)?)
    }

    pub fn read_u8(&mut self, source: &ByteSource) -> Result<u8, TrackError> {
        let b = self.peek_u8(source)?;
        self.advance_cursor(1);
        Ok(b)
    }

    pub fn read_bytes(&mut self, source: &ByteSource, count: usize) -> Result<Vec<u8>, TrackError> {
        self.check_bound(self.cursor, count)?;
        let bytes = source.bytes(self.cursor, count)?.to_vec();
        self.advance_cursor(count);
        Ok(bytes)
    }

    /// Read a MIDI-style variable-length quantity (at most four bytes).
    pub fn read_vlq(&mut self, source: &ByteSource) -> Result<u32, TrackError> {
        let at = self.cursor;
        let limit = self.end.map_or(source.size(), |end| end.min(source.size()));
        let avail = limit.saturating_sub(at).min(4);
        let window = if avail == 0 { &[][..] } else { source.bytes(at, avail)? };
        match decode_vlq(window) {
            Some((value, len)) => {
                self.advance_cursor(len);
                Ok(value)
            }
            None if avail < 4 => Err(TrackError::OutOfBounds { offset: at + avail, len: 1 }),
            None => Err(TrackError::Malformed { offset: at, reason: "variable-length value longer than 4 bytes".into() }),
        }
    }

    /// Offset the current step started at.
    pub fn step_offset(&self) -> usize {
        self.step_offset.unwrap_or(self.cursor)
    }

    pub fn unknown_opcode(&self, opcode: u8) -> TrackError {
        TrackError::UnknownOpcode { offset: self.step_offset(), opcode }
    }

    // ── Control flow ─────────────────────────────────────────────────────────

    pub fn jump(&mut self, target: usize) {
        self.cursor = target;
    }

    /// Jump to `target`, remembering the current cursor as the return address.
    pub fn call(&mut self, target: usize) {
        self.call_stack.push(self.cursor);
        self.cursor = target;
    }

    pub fn ret(&mut self) -> Result<(), TrackError> {
        let back = self.call_stack.pop().ok_or(TrackError::StackUnderflow { offset: self.step_offset() })?;
        self.cursor = back;
        Ok(())
    }

    /// Open a loop whose body starts at the current cursor.  `count` is the
    /// total number of passes; `None` repeats forever.
    pub fn begin_loop(&mut self, count: Option<u32>) {
        let remaining = count.map(|c| c.saturating_sub(1));
        self.loops.push(LoopFrame { start: self.cursor, remaining });
    }

    /// Close the innermost loop.  Returns `true` when the cursor jumped back
    /// to the loop start, `false` when the loop finished or none was open.
    pub fn end_loop(&mut self) -> bool {
        let Some(frame) = self.loops.last_mut() else {
            return false;
        };
        match frame.remaining {
            None => {
                self.cursor = frame.start;
                true
            }
            Some(0) => {
                self.loops.pop();
                false
            }
            Some(n) => {
                frame.remaining = Some(n - 1);
                self.cursor = frame.start;
                true
            }
        }
    }

    // ── Event primitives ─────────────────────────────────────────────────────

    fn push(&mut self, kind: EventKind) -> usize {
        self.push_at(self.tick, kind)
    }

    fn push_at(&mut self, tick: Tick, kind: EventKind) -> usize {
        self.timeline.push(TimedEvent { tick, kind, offset: self.step_offset });
        self.timeline.len() - 1
    }

    pub fn advance_time(&mut self, duration: Tick) {
        self.tick = self.tick.saturating_add(duration);
    }

    pub fn emit_rest(&mut self, duration: Tick) {
        self.advance_time(duration);
    }

    /// Note-on now and a matching note-off `duration` ticks later.
    pub fn emit_note_with_duration(&mut self, channel: u8, key: u8, velocity: u8, duration: Tick) {
        let channel = channel & 0x0F;
        self.push(EventKind::NoteOn { channel, key, velocity });
        let end = self.tick.saturating_add(duration);
        let off = self.push_at(end, EventKind::NoteOff { channel, key });
        self.pending.insert((channel, key), off);
    }

    /// Extend the still-sounding note on (`channel`, `key`) so it releases at
    /// `new_end` instead of attacking again.  Without such a note a fresh one
    /// is emitted from the current tick to `new_end`.  Returns whether it tied.
    pub fn tie_into_previous_note(&mut self, channel: u8, key: u8, velocity: u8, new_end: Tick) -> bool {
        let channel = channel & 0x0F;
        if let Some(&idx) = self.pending.get(&(channel, key)) {
            let off = &mut self.timeline[idx];
            if off.tick >= self.tick {
                off.tick = off.tick.max(new_end);
                return true;
            }
        }
        let duration = new_end.saturating_sub(self.tick);
        self.emit_note_with_duration(channel, key, velocity, duration);
        false
    }

    pub fn emit_note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        let channel = channel & 0x0F;
        self.pending.remove(&(channel, key));
        self.push(EventKind::NoteOn { channel, key, velocity });
    }

    pub fn emit_note_off(&mut self, channel: u8, key: u8) {
        let channel = channel & 0x0F;
        self.pending.remove(&(channel, key));
        self.push(EventKind::NoteOff { channel, key });
    }

    pub fn emit_controller(&mut self, channel: u8, controller: u8, value: u8) {
        self.push(EventKind::Controller { channel: channel & 0x0F, controller, value });
    }

    pub fn emit_volume(&mut self, channel: u8, value: u8) {
        self.emit_controller(channel, 7, value);
    }

    pub fn emit_pan(&mut self, channel: u8, value: u8) {
        self.emit_controller(channel, 10, value);
    }

    pub fn emit_expression(&mut self, channel: u8, value: u8) {
        self.emit_controller(channel, 11, value);
    }

    pub fn emit_program_change(&mut self, channel: u8, program: u8) {
        self.push(EventKind::ProgramChange { channel: channel & 0x0F, program });
    }

    pub fn emit_channel_pressure(&mut self, channel: u8, value: u8) {
        self.push(EventKind::ChannelPressure { channel: channel & 0x0F, value });
    }

    pub fn emit_pitch_bend(&mut self, channel: u8, value: i16) {
        self.push(EventKind::PitchBend { channel: channel & 0x0F, value: value.clamp(-8192, 8191) });
    }

    pub fn emit_tempo(&mut self, micros_per_quarter: u32) {
        self.push(EventKind::Tempo { micros_per_quarter: micros_per_quarter.min(0x00FF_FFFF) });
    }

    pub fn emit_tempo_bpm(&mut self, bpm: f64) {
        if bpm > 0.0 {
            self.emit_tempo((60_000_000.0 / bpm).round() as u32);
        }
    }

    pub fn emit_time_signature(&mut self, numerator: u8, denominator_pow: u8) {
        self.push(EventKind::TimeSignature {
            numerator,
            denominator_pow,
            clocks_per_click: 24,
            notated_32nds: 8,
        });
    }

    pub fn emit_track_name(&mut self, name: impl Into<String>) {
        self.push(EventKind::TrackName(name.into()));
    }

    pub fn emit_marker(&mut self, text: impl Into<String>) {
        self.push(EventKind::Marker(text.into()));
    }

    pub fn emit_text(&mut self, text: impl Into<String>) {
        self.push(EventKind::Text(text.into()));
    }

    pub fn emit_sysex(&mut self, data: Vec<u8>) {
        self.push(EventKind::SysEx(data));
    }

    pub fn emit_loop_start(&mut self) {
        self.push(EventKind::LoopStart);
    }

    pub fn emit_global_transpose(&mut self, semitones: i8) {
        self.push(EventKind::GlobalTranspose(semitones));
    }

    pub fn emit_end_of_track(&mut self) {
        self.push(EventKind::EndOfTrack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes(track: &Track) -> Vec<(Tick, bool)> {
        track
            .timeline()
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::NoteOn { .. } => Some((e.tick, true)),
                EventKind::NoteOff { .. } => Some((e.tick, false)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn consecutive_notes_stay_independent() {
        let mut t = Track::new(0);
        t.emit_note_with_duration(0, 60, 100, 96);
        t.advance_time(96);
        t.emit_note_with_duration(0, 60, 100, 96);
        assert_eq!(notes(&t), [(0, true), (96, false), (96, true), (192, false)]);
    }

    #[test]
    fn tie_extends_pending_release() {
        let mut t = Track::new(0);
        t.emit_note_with_duration(0, 60, 100, 96);
        t.advance_time(96);
        assert!(t.tie_into_previous_note(0, 60, 100, 192));
        assert_eq!(notes(&t), [(0, true), (192, false)]);
    }

    #[test]
    fn tie_without_pending_note_attacks() {
        let mut t = Track::new(0);
        t.emit_note_with_duration(0, 60, 100, 10);
        t.advance_time(50);
        assert!(!t.tie_into_previous_note(0, 60, 90, 80));
        assert_eq!(notes(&t), [(0, true), (10, false), (50, true), (80, false)]);
    }

    #[test]
    fn backward_jump_halts_with_one_marker() {
        let src = ByteSource::from_bytes("loop", vec![0x01, 0x02, 0x03]);
        let mut t = Track::new(0);
        let outcome = t.interpret(1000, |t| {
            let op = t.read_u8(&src)?;
            t.emit_note_with_duration(0, op, 100, 10);
            t.advance_time(10);
            if op == 3 {
                t.jump(0);
            }
            Ok(Step::Continue)
        });
        assert_eq!(outcome, TrackOutcome::LoopedForever { offset: 0 });
        let markers = t.timeline().iter().filter(|e| e.kind == EventKind::LoopForever).count();
        assert_eq!(markers, 1);
        assert_eq!(t.timeline().last().unwrap().tick, 30);
    }

    #[test]
    fn finite_loops_unroll() {
        // 0: begin loop x3, 1: note, 2: end loop, 3: end
        let src = ByteSource::from_bytes("rep", vec![0xA0, 0x10, 0xA1, 0xFF]);
        let mut t = Track::new(0);
        let outcome = t.interpret(1000, |t| match t.read_u8(&src)? {
            0xA0 => { t.begin_loop(Some(3)); Ok(Step::Continue) }
            0xA1 => { t.end_loop(); Ok(Step::Continue) }
            0xFF => Ok(Step::End),
            key  => { t.emit_note_with_duration(0, key, 64, 4); t.advance_time(4); Ok(Step::Continue) }
        });
        assert_eq!(outcome, TrackOutcome::Completed);
        assert_eq!(notes(&t).iter().filter(|(_, on)| *on).count(), 3);
        assert_eq!(t.tick(), 12);
    }

    #[test]
    fn unknown_opcode_and_bounds_end_the_pass() {
        let src = ByteSource::from_bytes("bad", vec![0x10, 0xEE]);
        let mut t = Track::new(0);
        let outcome = t.interpret(1000, |t| match t.read_u8(&src)? {
            0x10 => Ok(Step::Continue),
            op   => Err(t.unknown_opcode(op)),
        });
        assert_eq!(outcome, TrackOutcome::Failed(TrackError::UnknownOpcode { offset: 1, opcode: 0xEE }));

        let mut t = Track::new(0).with_end(1);
        let outcome = t.interpret(1000, |t| { t.read_u8(&src)?; Ok(Step::Continue) });
        assert_eq!(outcome, TrackOutcome::Failed(TrackError::OutOfBounds { offset: 1, len: 1 }));
    }

    #[test]
    fn step_budget_is_enforced() {
        let mut t = Track::new(0);
        let outcome = t.interpret(5, |t| {
            t.loop_state += 1;
            Ok(Step::Continue)
        });
        assert_eq!(outcome, TrackOutcome::Exhausted { steps: 5 });
    }

    #[test]
    fn reinterpretation_is_idempotent() {
        let src = ByteSource::from_bytes("x", vec![0x40, 0x41, 0xFF]);
        let mut t = Track::new(0).with_initial_event(EventKind::Tempo { micros_per_quarter: 500_000 });
        let run = |t: &mut Track| {
            t.interpret(100, |t| match t.read_u8(&src)? {
                0xFF => Ok(Step::End),
                k => { t.emit_note_with_duration(0, k, 100, 8); t.advance_time(8); Ok(Step::Continue) }
            })
        };
        run(&mut t);
        let first = t.timeline().to_vec();
        run(&mut t);
        assert_eq!(first, t.timeline());
        assert_eq!(first[0].kind, EventKind::Tempo { micros_per_quarter: 500_000 });
        assert_eq!(t.furthest(), 3);
    }

    #[test]
    fn subroutine_return_and_underflow() {
        let mut t = Track::new(0);
        t.cursor = 5;
        t.call(20);
        assert_eq!(t.cursor, 20);
        t.ret().unwrap();
        assert_eq!(t.cursor, 5);
        assert!(matches!(t.ret(), Err(TrackError::StackUnderflow { .. })));
    }

    #[test]
    fn variable_length_reads_respect_the_track_end() {
        let src = ByteSource::from_bytes("vlq", vec![0x81, 0x00, 0x83, 0xFF, 0xFF, 0xFF, 0x7F]);
        let mut t = Track::new(0).with_end(4);
        assert_eq!(t.read_vlq(&src), Ok(0x80));
        assert_eq!(t.cursor, 2);
        assert_eq!(t.read_vlq(&src), Err(TrackError::OutOfBounds { offset: 4, len: 1 }));

        let mut t = Track::new(2);
        assert!(matches!(t.read_vlq(&src), Err(TrackError::Malformed { offset: 2, .. })));
        assert_eq!(t.furthest(), 2);
    }
}
