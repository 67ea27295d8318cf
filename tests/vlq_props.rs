use proptest::prelude::*;
use seqdump::export::{decode_vlq, encode_vlq, MAX_VLQ};
use seqdump::{ByteSource, EventKind, StandardSequenceFile, StandardTrack, Step, Track, TrackOutcome};

/// An event of one of several priority classes, tagged with `tag`.
fn tagged(class: u8, tag: u8) -> EventKind {
    match class {
        0 => EventKind::Tempo { micros_per_quarter: u32::from(tag) + 1 },
        1 => EventKind::Marker(tag.to_string()),
        2 => EventKind::ProgramChange { channel: 0, program: tag },
        3 => EventKind::Controller { channel: 0, controller: 1, value: tag },
        4 => EventKind::NoteOff { channel: 0, key: tag },
        _ => EventKind::NoteOn { channel: 0, key: tag, velocity: 1 },
    }
}

fn tag_of(kind: &EventKind) -> u8 {
    match kind {
        EventKind::Tempo { micros_per_quarter } => (*micros_per_quarter - 1) as u8,
        EventKind::Marker(s) => s.parse().unwrap(),
        EventKind::ProgramChange { program, .. } => *program,
        EventKind::Controller { value, .. } => *value,
        EventKind::NoteOff { key, .. } => *key,
        EventKind::NoteOn { key, .. } => *key,
        other => panic!("unexpected {other:?}"),
    }
}

proptest! {
    #[test]
    fn vlq_round_trips(value in 0u32..=MAX_VLQ) {
        let bytes = encode_vlq(value).unwrap();
        prop_assert!(bytes.len() <= 4);
        prop_assert_eq!(decode_vlq(&bytes), Some((value, bytes.len())));
    }

    #[test]
    fn vlq_rejects_oversized(value in (MAX_VLQ + 1)..=u32::MAX) {
        prop_assert_eq!(encode_vlq(value), None);
    }

    #[test]
    fn output_order_is_tick_then_priority_then_emission(
        events in prop::collection::vec((0u32..6, 0u8..6), 0..100),
    ) {
        let mut smf = StandardSequenceFile::new(96);
        let mut track = StandardTrack::new();
        for (i, &(tick, class)) in events.iter().enumerate() {
            track.push(tick, tagged(class, i as u8));
        }
        smf.tracks.push(track);

        let ordered = smf.ordered_events(0);
        prop_assert_eq!(ordered.len(), events.len());
        for pair in ordered.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!((a.tick, a.priority) <= (b.tick, b.priority));
            if (a.tick, a.priority) == (b.tick, b.priority) {
                prop_assert!(tag_of(&a.payload) < tag_of(&b.payload));
            }
        }
        prop_assert!(smf.to_bytes().is_ok());
    }

    #[test]
    fn jumping_bytecode_terminates(code in prop::collection::vec(any::<u8>(), 1..64)) {
        let len = code.len();
        let src = ByteSource::from_bytes("fuzz", code);
        let mut track = Track::new(0).with_end(len);
        let outcome = track.interpret(len + 1, |t| {
            let op = t.read_u8(&src)?;
            if op & 0x80 != 0 {
                t.jump(usize::from(op & 0x7F) % len);
            } else if op == 0 {
                return Ok(Step::End);
            } else {
                t.emit_note_with_duration(0, op, 100, 4);
                t.advance_time(4);
            }
            Ok(Step::Continue)
        });
        let exhausted = matches!(outcome, TrackOutcome::Exhausted { .. });
        prop_assert!(!exhausted, "interpretation ran out of steps: {:?}", outcome);
        let markers = track.timeline().iter().filter(|e| e.kind == EventKind::LoopForever).count();
        prop_assert!(markers <= 1);
    }
}
