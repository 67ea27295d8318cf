//! PlayStation `pQES` sequences and `pBAV` sound banks.
//!
//! A SEQ is a big-endian header (version, PPQN, 24-bit tempo, time
//! signature) followed at 0x0F by a single MIDI-like event stream with running
//! status.  Meta events carry no length byte: `FF 51 tt tt tt` sets the tempo
//! and `FF 2F` ends the stream.  Loops are NRPN controllers: CC 99 = 20 arms a
//! loop start whose pass count follows in CC 6 (127 repeats forever), CC 99 =
//! 30 closes the loop.
//!
//! A VAB is little-endian: a 0x20-byte header, 128 program records, one
//! 16-tone block per program, a 256-entry VAG size table and, when present,
//! the VAG bodies back to back.

use crate::event::EventKind;
use crate::file::{Instrument, InstrumentSet, Sample, SampleCollection};
use crate::format::{Format, ScanContext};
use crate::formats::{channel_message, read_status};
use crate::sequence::SequenceFile;
use crate::source::{ByteSource, Endian, Pattern};
use crate::track::{Step, Track, TrackError};

pub const SEQ_MAGIC:      &[u8; 4] = b"pQES";
pub const SEQ_VERSION:    u32 = 1;
pub const SEQ_HEADER_LEN: usize = 0x0F;

pub const VAB_MAGIC:       &[u8; 4] = b"pBAV";
pub const VAB_MAX_VERSION: u32 = 7;
const VAB_HEADER_LEN:  usize = 0x20;
const PROGRAM_LEN:     usize = 0x10;
const PROGRAM_COUNT:   usize = 128;
const TONE_LEN:        usize = 0x20;
const TONES_PER_BLOCK: usize = 16;
const VAG_TABLE_LEN:   usize = 256 * 2;

const NRPN_MSB:        u8 = 99;
const DATA_ENTRY:      u8 = 6;
const NRPN_LOOP_START: u8 = 20;
const NRPN_LOOP_END:   u8 = 30;
const LOOP_INFINITE:   u8 = 127;

pub struct PsxFormat;

fn display_name(source: &ByteSource, offset: usize, kind: &str) -> String {
    if offset == 0 {
        source.stem().to_owned()
    } else {
        format!("{} {kind} @0x{offset:X}", source.stem())
    }
}

// ── SEQ ───────────────────────────────────────────────────────────────────────

fn parse_seq(source: &ByteSource, offset: usize) -> Option<SequenceFile> {
    if !source.contains_range(offset, SEQ_HEADER_LEN) {
        return None;
    }
    let version = source.word(offset + 4, Endian::Big).ok()?;
    let ppqn    = source.short(offset + 8, Endian::Big).ok()?;
    let tempo   = source.triple_be(offset + 0x0A).ok()?;
    let numerator       = source.byte(offset + 0x0D).ok()?;
    let denominator_pow = source.byte(offset + 0x0E).ok()?;
    if version != SEQ_VERSION || ppqn == 0 || ppqn >= 0x8000 || tempo == 0 {
        return None;
    }
    let track = Track::new(offset + SEQ_HEADER_LEN)
        .with_end(source.size())
        .with_initial_event(EventKind::Tempo { micros_per_quarter: tempo })
        .with_initial_event(EventKind::TimeSignature {
            numerator,
            denominator_pow,
            clocks_per_click: 24,
            notated_32nds: 8,
        });
    Some(SequenceFile::new(ppqn).with_track(track))
}

/// Control change, with the NRPN loop controllers turned into loop frames.
/// `loop_state` holds an armed loop start until its count arrives.
fn controller(track: &mut Track, channel: u8, controller: u8, value: u8) {
    match (controller, value) {
        (NRPN_MSB, NRPN_LOOP_START) => track.loop_state = u64::from(NRPN_LOOP_START),
        (NRPN_MSB, NRPN_LOOP_END) => {
            track.loop_state = 0;
            track.end_loop();
        }
        (DATA_ENTRY, count) if track.loop_state == u64::from(NRPN_LOOP_START) => {
            track.loop_state = 0;
            if count == LOOP_INFINITE {
                track.emit_loop_start();
                track.begin_loop(None);
            } else {
                track.begin_loop(Some(u32::from(count)));
            }
        }
        _ => track.emit_controller(channel, controller, value),
    }
}

// ── VAB ───────────────────────────────────────────────────────────────────────

struct Vab {
    id:          u32,
    instruments: InstrumentSet,
    samples:     Option<SampleCollection>,
    header_len:  usize,
    length:      usize,
}

fn parse_vab(source: &ByteSource, offset: usize) -> Option<Vab> {
    let version = source.word(offset + 4, Endian::Little).ok()?;
    let id      = source.word(offset + 8, Endian::Little).ok()?;
    let programs = usize::from(source.short(offset + 0x12, Endian::Little).ok()?);
    let tones    = usize::from(source.short(offset + 0x14, Endian::Little).ok()?);
    let vags     = usize::from(source.short(offset + 0x16, Endian::Little).ok()?);
    if version == 0
        || version > VAB_MAX_VERSION
        || programs == 0
        || programs > PROGRAM_COUNT
        || tones > programs * TONES_PER_BLOCK
        || vags > 254
    {
        return None;
    }

    let tone_base  = offset + VAB_HEADER_LEN + PROGRAM_COUNT * PROGRAM_LEN;
    let vag_table  = tone_base + programs * TONES_PER_BLOCK * TONE_LEN;
    let header_len = vag_table + VAG_TABLE_LEN - offset;
    if !source.contains_range(offset, header_len) {
        return None;
    }

    let mut instruments = Vec::new();
    let mut block = 0;
    for program in 0..PROGRAM_COUNT {
        let count = usize::from(source.byte(offset + VAB_HEADER_LEN + program * PROGRAM_LEN).ok()?);
        if count == 0 {
            continue;
        }
        if block >= programs {
            break;
        }
        let mut samples = Vec::new();
        for tone in 0..count.min(TONES_PER_BLOCK) {
            let at = tone_base + block * TONES_PER_BLOCK * TONE_LEN + tone * TONE_LEN + 0x16;
            let vag = source.short(at, Endian::Little).ok()?;
            if vag > 0 {
                samples.push(u32::from(vag) - 1);
            }
        }
        instruments.push(Instrument { bank: 0, program: program as u32, samples });
        block += 1;
    }

    // Entry 0 of the size table is unused; VAG numbering starts at 1.
    let body = offset + header_len;
    let mut pos = body;
    let mut list = Vec::with_capacity(vags);
    for i in 1..=vags {
        let size = usize::from(source.short(vag_table + i * 2, Endian::Little).ok()?) << 3;
        list.push(Sample { offset: pos, length: size, name: format!("vag{:03}", i - 1) });
        pos += size;
    }
    let complete = vags > 0 && source.contains_range(body, pos - body);
    Some(Vab {
        id,
        instruments: InstrumentSet { instruments },
        samples: complete.then_some(SampleCollection { samples: list }),
        header_len,
        length: if complete { pos - offset } else { header_len },
    })
}

impl Format for PsxFormat {
    fn name(&self) -> &'static str { "psx" }

    fn extensions(&self) -> &'static [&'static str] { &["seq", "vab"] }

    fn scan(&self, ctx: &mut ScanContext<'_>) {
        let source = ctx.source();

        let magic = Pattern::exact(SEQ_MAGIC);
        let mut from = 0;
        while let Some(offset) = source.search_pattern(&magic, from) {
            from = offset + 1;
            let Some(seq) = parse_seq(source, offset) else { continue };
            let file = ctx.add_sequence(display_name(source, offset, "SEQ"), offset, SEQ_HEADER_LEN, seq);
            file.provisional_length = true;
        }

        let magic = Pattern::exact(VAB_MAGIC);
        let mut from = 0;
        while let Some(offset) = source.search_pattern(&magic, from) {
            from = offset + 1;
            let Some(vab) = parse_vab(source, offset) else { continue };
            let name = display_name(source, offset, "VAB");
            match vab.samples {
                Some(samples) => {
                    let body = vab.header_len;
                    ctx.add_instrument_set(name.clone(), offset, body, vab.instruments).match_id = Some(vab.id);
                    ctx.add_sample_collection(name, offset + body, vab.length - body, samples).match_id = Some(vab.id);
                }
                // Without its VAG bodies the bank cannot back any instrument.
                None => ctx.add_misc(name, offset, vab.length).match_id = Some(vab.id),
            }
            from = offset + vab.length;
        }
    }

    fn read_event(&self, source: &ByteSource, track: &mut Track) -> Result<Step, TrackError> {
        let delta = track.read_vlq(source)?;
        track.advance_time(delta);
        let status = read_status(source, track)?;
        match status {
            0xFF => match track.read_u8(source)? {
                0x2F => {
                    track.emit_end_of_track();
                    Ok(Step::End)
                }
                0x51 => {
                    let t = track.read_bytes(source, 3)?;
                    track.emit_tempo(u32::from_be_bytes([0, t[0], t[1], t[2]]));
                    Ok(Step::Continue)
                }
                other => Err(TrackError::Malformed {
                    offset: track.step_offset(),
                    reason: format!("unsupported meta event 0x{other:02X}"),
                }),
            },
            0x80..=0xEF => {
                if let Some((cc, value)) = channel_message(source, track, status)? {
                    controller(track, status & 0x0F, cc, value);
                }
                Ok(Step::Continue)
            }
            op => Err(track.unknown_opcode(op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::file::{FileKind, LogicalFile};
    use crate::source::SourceId;
    use crate::track::TrackOutcome;

    fn seq_bytes(body: &[u8]) -> Vec<u8> {
        let mut out = SEQ_MAGIC.to_vec();
        out.extend_from_slice(&SEQ_VERSION.to_be_bytes());
        out.extend_from_slice(&480u16.to_be_bytes());
        out.extend_from_slice(&[0x07, 0xA1, 0x20, 4, 2]);
        out.extend_from_slice(body);
        out
    }

    fn vab_bytes(with_body: bool) -> Vec<u8> {
        let programs = 1usize;
        let mut out = VAB_MAGIC.to_vec();
        out.extend_from_slice(&7u32.to_le_bytes());
        out.extend_from_slice(&42u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(programs as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.resize(VAB_HEADER_LEN, 0);

        let mut prog = vec![0u8; PROGRAM_COUNT * PROGRAM_LEN];
        prog[3 * PROGRAM_LEN] = 1;
        out.extend_from_slice(&prog);

        let mut tones = vec![0u8; programs * TONES_PER_BLOCK * TONE_LEN];
        tones[0x16..0x18].copy_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&tones);

        let mut table = vec![0u8; VAG_TABLE_LEN];
        table[2..4].copy_from_slice(&2u16.to_le_bytes());
        table[4..6].copy_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&table);
        if with_body {
            out.extend_from_slice(&[0x11; 48]);
        }
        out
    }

    fn scan(name: &str, data: Vec<u8>) -> (ByteSource, Vec<LogicalFile>) {
        let src = ByteSource::from_bytes(name, data);
        let mut ctx = ScanContext::new(&src, SourceId(0), "psx");
        PsxFormat.scan(&mut ctx);
        let found = ctx.into_found();
        (src, found)
    }

    fn interpret(src: &ByteSource, file: &mut LogicalFile) -> Vec<(u32, EventKind)> {
        let seq = file.as_sequence_mut().unwrap();
        seq.interpret(&PsxFormat, src, 10_000, &mut Diagnostics::new());
        seq.tracks[0].timeline().iter().map(|e| (e.tick, e.kind.clone())).collect()
    }

    #[test]
    fn infinite_nrpn_loop_halts_once() {
        let (src, mut found) = scan("bgm.seq", seq_bytes(&[
            0x00, 0x90, 0x3C, 0x64,
            0x30, 0x3C, 0x00,
            0x00, 0xB0, 0x63, 0x14,
            0x00, 0x06, 0x7F,
            0x00, 0x90, 0x40, 0x64,
            0x18, 0x40, 0x00,
            0x00, 0xB0, 0x63, 0x1E,
            0x00, 0xFF, 0x2F,
        ]));
        assert_eq!(found.len(), 1);
        let events = interpret(&src, &mut found[0]);
        assert_eq!(events, [
            (0,  EventKind::Tempo { micros_per_quarter: 500_000 }),
            (0,  EventKind::TimeSignature { numerator: 4, denominator_pow: 2, clocks_per_click: 24, notated_32nds: 8 }),
            (0,  EventKind::NoteOn { channel: 0, key: 0x3C, velocity: 0x64 }),
            (48, EventKind::NoteOff { channel: 0, key: 0x3C }),
            (48, EventKind::LoopStart),
            (48, EventKind::NoteOn { channel: 0, key: 0x40, velocity: 0x64 }),
            (72, EventKind::NoteOff { channel: 0, key: 0x40 }),
            (72, EventKind::LoopForever),
        ]);
        let track = &found[0].as_sequence().unwrap().tracks[0];
        assert!(matches!(track.outcome(), Some(TrackOutcome::LoopedForever { .. })));
    }

    #[test]
    fn counted_nrpn_loop_unrolls() {
        let (src, mut found) = scan("bgm.seq", seq_bytes(&[
            0x00, 0xB0, 0x63, 0x14,
            0x00, 0x06, 0x03,
            0x00, 0x91, 0x40, 0x64,
            0x10, 0x40, 0x00,
            0x00, 0xB0, 0x63, 0x1E,
            0x00, 0xB0, 0x07, 0x64,
            0x00, 0xFF, 0x2F,
        ]));
        let events = interpret(&src, &mut found[0]);
        let ons = events.iter().filter(|(_, k)| matches!(k, EventKind::NoteOn { .. })).count();
        assert_eq!(ons, 3);
        assert!(events.contains(&(48, EventKind::Controller { channel: 0, controller: 7, value: 0x64 })));
        assert_eq!(events.last(), Some(&(48, EventKind::EndOfTrack)));
        assert!(!events.iter().any(|(_, k)| *k == EventKind::LoopStart));
    }

    #[test]
    fn bad_headers_are_skipped() {
        let mut data = seq_bytes(&[0x00, 0xFF, 0x2F]);
        data[7] = 9;
        assert!(scan("x.bin", data).1.is_empty());
        assert!(scan("x.bin", b"pQES\x00\x00".to_vec()).1.is_empty());
        assert!(scan("x.bin", b"pBAV".to_vec()).1.is_empty());
    }

    #[test]
    fn vab_with_body_yields_bank_and_samples() {
        let data = vab_bytes(true);
        let total = data.len();
        let (_, found) = scan("bgm.vab", data);
        assert_eq!(found.len(), 2);
        let set = found[0].as_instrument_set().unwrap();
        assert_eq!(set.instruments, [Instrument { bank: 0, program: 3, samples: vec![1] }]);
        let samples = found[1].as_sample_collection().unwrap();
        assert_eq!(samples.samples.len(), 2);
        assert_eq!(samples.samples[1].length, 32);
        assert_eq!(found[1].offset + found[1].length, total);
        assert_eq!(samples.samples[0].offset, found[1].offset);
        assert!(found.iter().all(|f| f.match_id == Some(42)));
    }

    #[test]
    fn vab_header_only_is_misc() {
        let (_, found) = scan("bgm.vh", vab_bytes(false));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind(), FileKind::Misc);
    }
}
