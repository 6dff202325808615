use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use etherbone_protocol::{Frame, Record, Width};

fn block_write(records: usize) -> Frame {
    let records = (0..records)
        .map(|i| {
            Record::write(
                0x4000_0000 + (i as u64) * 4,
                Width::Word,
                (i as u32).to_be_bytes(),
            )
        })
        .collect();
    Frame::request(1, records)
}

fn encode_frames(c: &mut Criterion) {
    let frame = block_write(64);
    c.bench_function("encode 64 word writes", |b| {
        b.iter(|| black_box(&frame).encode())
    });
}

fn decode_frames(c: &mut Criterion) {
    let bytes = block_write(64).encode().expect("Frame is well-formed");
    c.bench_function("decode 64 word writes", |b| {
        b.iter(|| Frame::decode(black_box(&bytes)))
    });
}

criterion_group!(benches, encode_frames, decode_frames);
criterion_main!(benches);
