use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use midea_lan::core::codec::{FrameType, TransportState};
use midea_lan::core::packet::{self, PacketKind};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [64usize, 512, 4096];

    for &size in &payload_sizes {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            let mut state = TransportState::new();
            state.set_tcp_key([0u8; 32]);
            b.iter_batched(
                || payload.clone(),
                |payload| {
                    state
                        .encode_frame(&payload, FrameType::EncryptedRequest)
                        .unwrap()
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("decode_{size}b"), |b| {
            let mut tx = TransportState::new();
            tx.set_tcp_key([0u8; 32]);
            let wire = tx
                .encode_frame(&payload, FrameType::EncryptedRequest)
                .unwrap();
            let mut rx = TransportState::new();
            rx.set_tcp_key([0u8; 32]);
            b.iter(|| {
                rx.feed(&wire);
                let frames = rx.decode_stream().unwrap();
                assert_eq!(frames.len(), 1);
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_inner_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("inner_packet");
    let command = vec![0xAB; 48];

    group.bench_function("build", |b| {
        b.iter(|| packet::build(123_456_789, &command, PacketKind::Encrypted))
    });

    group.bench_function("parse", |b| {
        let raw = packet::build(123_456_789, &command, PacketKind::Encrypted);
        b.iter(|| packet::parse(&raw).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_inner_packet);
criterion_main!(benches);
