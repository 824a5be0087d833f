use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tokio::sync::mpsc;
use zwriter_collab::{
    AwarenessStore, Compression, ConnectionId, DocumentId, FrameCodec, PeerHandle, Session,
    SyncMessage,
};
use zwriter_crdt::Document;

fn typed_update(chars: usize) -> Vec<u8> {
    let mut doc = Document::with_replica(1);
    doc.insert(0, &"x".repeat(chars))
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = SyncMessage::sync_step2(typed_update(64));

    c.bench_function("sync_step2_encode_64_chars", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let encoded = SyncMessage::sync_step2(typed_update(64)).encode().unwrap();

    c.bench_function("sync_step2_decode_64_chars", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_lz4_frames(c: &mut Criterion) {
    let codec = FrameCodec::new(Compression::Lz4 { threshold: 1024 }, 16 * 1024 * 1024);
    let body = SyncMessage::sync_step2(typed_update(10_000)).encode().unwrap();
    let frame = codec.encode(&body);

    c.bench_function("lz4_frame_encode_10k_chars", |b| {
        b.iter(|| black_box(codec.encode(black_box(&body))))
    });
    c.bench_function("lz4_frame_decode_10k_chars", |b| {
        b.iter(|| black_box(codec.decode(black_box(&frame)).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let peers: Vec<ConnectionId> = (0..50).map(|_| ConnectionId::new()).collect();
    let mut store = AwarenessStore::new(ConnectionId::new());
    let mut seq = 0u64;

    c.bench_function("awareness_apply_50_peers", |b| {
        b.iter(|| {
            seq += 1;
            for id in &peers {
                black_box(store.apply_remote(*id, Some(b"{\"cursor\":12}".to_vec()), seq, None));
            }
        })
    });
}

fn bench_session_fan_out(c: &mut Criterion) {
    let session = Session::new(DocumentId::parse("bench").unwrap(), None);
    let mut receivers: Vec<_> = (0..100)
        .map(|_| {
            let (tx, rx) = mpsc::channel(16);
            session.add_peer(ConnectionId::new(), PeerHandle::new(tx, None));
            rx
        })
        .collect();
    let msg = SyncMessage::sync_step2(typed_update(16));

    c.bench_function("session_broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(session.broadcast(None, black_box(&msg)));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_lz4_frames,
    bench_awareness_apply,
    bench_session_fan_out,
);
criterion_main!(benches);
