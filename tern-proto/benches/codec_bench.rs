use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tern_proto::core::{Encoding, Priority, Timestamp, WireExpr, ZId};
use tern_proto::network::{NetworkMessage, PushBody};
use tern_proto::transport::TransportMessage;
use tern_proto::zint::{Reader, Writer};

fn make_push(payload_len: usize) -> NetworkMessage {
    NetworkMessage::Push {
        wire_expr: WireExpr::from_str("demo/example/sensor/temperature").to_owned(),
        qos: Priority::default(),
        body: PushBody::Put {
            timestamp: Some(Timestamp {
                time_ms: 1_700_000_000_000,
                id: ZId::new(&[7; 16]).unwrap(),
            }),
            encoding: Encoding::text_plain(),
            payload: vec![0x42; payload_len],
            attachment: None,
        },
    }
}

fn bench_codec_hot_path(c: &mut Criterion) {
    let mut g = c.benchmark_group("codec");

    for payload_len in [16usize, 512, 4096] {
        let frame = TransportMessage::Frame {
            reliable: true,
            sn: 12345,
            payload: vec![make_push(payload_len)],
        };
        let mut w = Writer::unbounded();
        frame.encode(&mut w).unwrap();
        let bytes = w.into_vec();

        g.bench_function(format!("encode_frame_{payload_len}"), |b| {
            b.iter(|| {
                let mut w = Writer::unbounded();
                black_box(&frame).encode(&mut w).unwrap();
                black_box(w.into_vec())
            })
        });

        g.bench_function(format!("decode_frame_{payload_len}"), |b| {
            b.iter(|| {
                let mut r = Reader::new(black_box(&bytes));
                black_box(TransportMessage::decode(&mut r).unwrap())
            })
        });
    }

    g.finish();
}

fn bench_varint(c: &mut Criterion) {
    let mut g = c.benchmark_group("zint");
    let values = [0u64, 0x7f, 0x3fff, u32::MAX as u64, u64::MAX];

    g.bench_function("write_read_mixed", |b| {
        b.iter(|| {
            let mut w = Writer::unbounded();
            for &v in black_box(&values) {
                w.write_zint(v).unwrap();
            }
            let buf = w.into_vec();
            let mut r = Reader::new(&buf);
            for _ in 0..values.len() {
                black_box(r.read_zint().unwrap());
            }
        })
    });

    g.finish();
}

criterion_group!(benches, bench_codec_hot_path, bench_varint);
criterion_main!(benches);
