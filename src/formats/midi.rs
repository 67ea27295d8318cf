//! Standard MIDI Files embedded anywhere in a source.
//!
//! The scanner looks for `MThd`, checks the header and walks the chunk chain;
//! each `MTrk` chunk becomes one bounded track.  Files using SMPTE timing are
//! skipped since their ticks have no PPQN.

use crate::format::{Format, ScanContext};
use crate::formats::{channel_message, read_status};
use crate::sequence::SequenceFile;
use crate::source::{ByteSource, Endian, Pattern};
use crate::track::{Step, Track, TrackError};

const HEADER_LEN: usize = 6;
/// Stop walking a chunk chain after this many foreign chunks in a row.
const MAX_ALIEN_CHUNKS: usize = 16;

pub struct MidiFormat;

impl MidiFormat {
    /// Validate the header at `offset` and collect its tracks.  Returns the
    /// sequence and the offset one past its last chunk.
    fn parse(source: &ByteSource, offset: usize) -> Option<(SequenceFile, usize)> {
        let header_len = source.word(offset + 4, Endian::Big).ok()? as usize;
        if header_len < HEADER_LEN {
            return None;
        }
        let format   = source.short(offset + 8, Endian::Big).ok()?;
        let ntracks  = source.short(offset + 10, Endian::Big).ok()?;
        let division = source.short(offset + 12, Endian::Big).ok()?;
        if format > 2 || ntracks == 0 || division == 0 || division & 0x8000 != 0 {
            return None;
        }

        let mut seq = SequenceFile::new(division);
        let mut pos = offset.checked_add(8 + header_len)?;
        let mut aliens = 0;
        while seq.tracks.len() < usize::from(ntracks) && aliens < MAX_ALIEN_CHUNKS {
            let Ok(id) = source.bytes(pos, 4) else { break };
            let Ok(len) = source.word(pos + 4, Endian::Big) else { break };
            let data = pos + 8;
            let Some(end) = data.checked_add(len as usize).filter(|&e| e <= source.size()) else {
                break;
            };
            if id == b"MTrk" {
                seq.tracks.push(Track::new(data).with_end(end));
                aliens = 0;
            } else {
                aliens += 1;
            }
            pos = end;
        }
        if seq.tracks.is_empty() {
            return None;
        }
        Some((seq, pos))
    }

    fn meta(source: &ByteSource, track: &mut Track) -> Result<Step, TrackError> {
        let kind = track.read_u8(source)?;
        let len = track.read_vlq(source)? as usize;
        let data = track.read_bytes(source, len)?;
        match (kind, data.as_slice()) {
            (0x2F, _) => {
                track.emit_end_of_track();
                return Ok(Step::End);
            }
            (0x51, &[a, b, c]) => {
                track.emit_tempo(u32::from_be_bytes([0, a, b, c]));
            }
            (0x58, &[n, d, ..]) => track.emit_time_signature(n, d),
            (0x01, text) => track.emit_text(String::from_utf8_lossy(text)),
            (0x03, text) => track.emit_track_name(String::from_utf8_lossy(text)),
            (0x06, text) => track.emit_marker(String::from_utf8_lossy(text)),
            _ => {}
        }
        Ok(Step::Continue)
    }
}

impl Format for MidiFormat {
    fn name(&self) -> &'static str { "midi" }

    fn extensions(&self) -> &'static [&'static str] { &["mid", "midi", "smf"] }

    fn scan(&self, ctx: &mut ScanContext<'_>) {
        let source = ctx.source();
        let magic = Pattern::exact(b"MThd");
        let mut from = 0;
        while let Some(offset) = source.search_pattern(&magic, from) {
            let Some((seq, end)) = Self::parse(source, offset) else {
                from = offset + 1;
                continue;
            };
            let name = if offset == 0 {
                source.stem().to_owned()
            } else {
                format!("{} @0x{offset:X}", source.stem())
            };
            ctx.add_sequence(name, offset, end - offset, seq);
            from = end;
        }
    }

    fn read_event(&self, source: &ByteSource, track: &mut Track) -> Result<Step, TrackError> {
        let delta = track.read_vlq(source)?;
        track.advance_time(delta);
        let status = read_status(source, track)?;
        match status {
            0xFF => Self::meta(source, track),
            0xF0 | 0xF7 => {
                let len = track.read_vlq(source)? as usize;
                let data = track.read_bytes(source, len)?;
                if status == 0xF0 {
                    track.emit_sysex(data);
                }
                Ok(Step::Continue)
            }
            0x80..=0xEF => {
                if let Some((controller, value)) = channel_message(source, track, status)? {
                    track.emit_controller(status & 0x0F, controller, value);
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
    use crate::event::EventKind;
    use crate::source::SourceId;

    fn smf(tracks: &[&[u8]]) -> Vec<u8> {
        let mut out = b"MThd\x00\x00\x00\x06\x00\x01".to_vec();
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&96u16.to_be_bytes());
        for t in tracks {
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(t.len() as u32).to_be_bytes());
            out.extend_from_slice(t);
        }
        out
    }

    fn scan(data: Vec<u8>) -> (ByteSource, Vec<crate::file::LogicalFile>) {
        let src = ByteSource::from_bytes("dump.bin", data);
        let mut ctx = ScanContext::new(&src, SourceId(0), "midi");
        MidiFormat.scan(&mut ctx);
        let found = ctx.into_found();
        (src, found)
    }

    #[test]
    fn finds_embedded_files() {
        let song = smf(&[b"\x00\xFF\x2F\x00".as_slice()]);
        let mut data = vec![0xAA; 32];
        data.extend_from_slice(&song);
        data.extend_from_slice(b"MThd garbage");
        let (_, found) = scan(data);
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].offset, found[0].length), (32, song.len()));
        assert_eq!(found[0].name, "dump @0x20");
    }

    #[test]
    fn truncated_and_smpte_headers_are_ignored() {
        let mut song = smf(&[b"\x00\xFF\x2F\x00".as_slice()]);
        song.truncate(song.len() - 2);
        assert!(scan(song).1.is_empty());

        let mut smpte = smf(&[b"\x00\xFF\x2F\x00".as_slice()]);
        smpte[12] = 0xE7;
        assert!(scan(smpte).1.is_empty());
    }

    #[test]
    fn decodes_running_status_and_meta() {
        let body: &[u8] = &[
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20,
            0x00, 0x90, 0x3C, 0x64,
            0x30, 0x3E, 0x64,
            0x30, 0x3C, 0x00,
            0x00, 0xB1, 0x07, 0x50,
            0x10, 0xE1, 0x00, 0x40,
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let (src, mut found) = scan(smf(&[body]));
        let seq = found[0].as_sequence_mut().unwrap();
        let mut log = Diagnostics::new();
        seq.interpret(&MidiFormat, &src, 1000, &mut log);
        assert!(log.is_empty());
        let kinds: Vec<_> = seq.tracks[0].timeline().iter().map(|e| (e.tick, e.kind.clone())).collect();
        assert_eq!(kinds, [
            (0,  EventKind::Tempo { micros_per_quarter: 500_000 }),
            (0,  EventKind::NoteOn { channel: 0, key: 0x3C, velocity: 0x64 }),
            (48, EventKind::NoteOn { channel: 0, key: 0x3E, velocity: 0x64 }),
            (96, EventKind::NoteOff { channel: 0, key: 0x3C }),
            (96, EventKind::Controller { channel: 1, controller: 7, value: 0x50 }),
            (112, EventKind::PitchBend { channel: 1, value: 0 }),
            (112, EventKind::EndOfTrack),
        ]);
    }

    #[test]
    fn data_byte_without_status_fails_the_track() {
        let (src, mut found) = scan(smf(&[b"\x00\x3C\x64".as_slice()]));
        let seq = found[0].as_sequence_mut().unwrap();
        let mut log = Diagnostics::new();
        seq.interpret(&MidiFormat, &src, 1000, &mut log);
        assert_eq!(log.len(), 1);
        assert!(seq.tracks[0].outcome().unwrap().is_failure());
    }
}
