//! Built-in formats.

pub mod midi;
pub mod psx;

use std::sync::Arc;

use crate::format::Format;
use crate::source::ByteSource;
use crate::track::{Track, TrackError};

pub use midi::MidiFormat;
pub use psx::PsxFormat;

/// Every built-in format, in scan order.
pub fn builtin() -> Vec<Arc<dyn Format>> {
    vec![Arc::new(MidiFormat), Arc::new(PsxFormat)]
}

/// Status byte for the next event: an explicit one (remembered for running
/// status when it is a channel message) or the running one.
pub(crate) fn read_status(source: &ByteSource, track: &mut Track) -> Result<u8, TrackError> {
    if track.peek_u8(source)? & 0x80 != 0 {
        let status = track.read_u8(source)?;
        if status < 0xF0 {
            track.running_status = Some(status);
        }
        return Ok(status);
    }
    track.running_status.ok_or_else(|| TrackError::Malformed {
        offset: track.step_offset(),
        reason: "data byte without running status".into(),
    })
}

/// Decode the data bytes of channel message `status` and emit it.  Returns
/// `(controller, value)` for control changes so callers can react to them;
/// those are not emitted here.
pub(crate) fn channel_message(
    source: &ByteSource,
    track:  &mut Track,
    status: u8,
) -> Result<Option<(u8, u8)>, TrackError> {
    let channel = status & 0x0F;
    match status & 0xF0 {
        0x80 => {
            let key = track.read_u8(source)? & 0x7F;
            track.read_u8(source)?;
            track.emit_note_off(channel, key);
        }
        0x90 => {
            let key = track.read_u8(source)? & 0x7F;
            let velocity = track.read_u8(source)? & 0x7F;
            if velocity == 0 {
                track.emit_note_off(channel, key);
            } else {
                track.emit_note_on(channel, key, velocity);
            }
        }
        // Polyphonic pressure has no timeline representation.
        0xA0 => {
            track.read_bytes(source, 2)?;
        }
        0xB0 => {
            let controller = track.read_u8(source)? & 0x7F;
            let value = track.read_u8(source)? & 0x7F;
            return Ok(Some((controller, value)));
        }
        0xC0 => {
            let program = track.read_u8(source)? & 0x7F;
            track.emit_program_change(channel, program);
        }
        0xD0 => {
            let value = track.read_u8(source)? & 0x7F;
            track.emit_channel_pressure(channel, value);
        }
        0xE0 => {
            let lsb = i16::from(track.read_u8(source)? & 0x7F);
            let msb = i16::from(track.read_u8(source)? & 0x7F);
            track.emit_pitch_bend(channel, ((msb << 7) | lsb) - 8192);
        }
        _ => return Err(track.unknown_opcode(status)),
    }
    Ok(None)
}
