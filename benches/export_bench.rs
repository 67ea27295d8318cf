use criterion::{black_box, criterion_group, criterion_main, Criterion};
use seqdump::{ByteSource, Registry, RegistryConfig, SequenceFile, StandardSequenceFile, Track};

/// A 16-track sequence with `notes` notes per track.
fn busy_sequence(notes: u32) -> SequenceFile {
    let mut seq = SequenceFile::new(480);
    for ch in 0..16u8 {
        let mut t = Track::new(0);
        t.emit_tempo(500_000);
        t.emit_program_change(ch, ch);
        for i in 0..notes {
            t.emit_note_with_duration(ch, 36 + (i % 48) as u8, 100, 120);
            if i % 8 == 0 {
                t.emit_controller(ch, 7, (i % 128) as u8);
            }
            t.advance_time(120);
        }
        seq.tracks.push(t);
    }
    seq
}

fn smf_file(events: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for i in 0..events {
        body.extend_from_slice(&[0x10, 0x90, 0x30 + (i % 32) as u8, 0x64, 0x10, 0x80, 0x30 + (i % 32) as u8, 0x40]);
    }
    body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
    let mut out = b"MThd\x00\x00\x00\x06\x00\x01\x00\x01\x00\x60MTrk".to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn bench_serialize(c: &mut Criterion) {
    let smf = StandardSequenceFile::from_sequence(&busy_sequence(2_000));
    c.bench_function("serialize_16x2000_notes", |b| b.iter(|| black_box(&smf).to_bytes().unwrap()));
}

fn bench_open_and_export(c: &mut Criterion) {
    let mut dump = vec![0u8; 1024 * 1024];
    dump.extend_from_slice(&smf_file(10_000));

    c.bench_function("open_1mb_dump_and_export", |b| {
        b.iter(|| {
            let mut reg = Registry::with_builtin(RegistryConfig::default()).unwrap();
            reg.open(ByteSource::from_bytes("dump.bin", black_box(dump.clone()))).unwrap();
            let ids: Vec<_> = reg.collections().map(|(id, _)| id).collect();
            for id in ids {
                black_box(reg.export(id).unwrap().to_bytes().unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_serialize, bench_open_and_export);
criterion_main!(benches);
