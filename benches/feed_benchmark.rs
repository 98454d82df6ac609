//! Benchmarks for frame decoding and market state updates

use std::collections::BTreeMap;

use bytes::BytesMut;
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use odds_feed::market::{
    Delta, MarketIds, MarketRecord, MarketSnapshot, MarketStateStore, OutcomeQuote, StoreMetrics,
};
use odds_feed::parser::parse_message_body;
use odds_feed::stomp::{Frame, FrameCodec};
use rust_decimal::Decimal;
use tokio_util::codec::Decoder;

const MESSAGE_BODY: &str = r#"[{"gid":47414947,"sid":"NFL","lid":3,"seq":12,"ts":1700000000000,"lvg":2,"mkt":{"s":[{"h":-110,"hp":-1.5,"v":-110,"vp":1.5}],"m":[{"h":-150,"v":130}],"t":[{"h":-105,"hp":44.5,"v":-115,"vp":44.5}]}}]"#;

fn message_frame() -> Frame {
    Frame::new(odds_feed::stomp::Command::Message)
        .with_header("destination", "/exchange/BetSlipRTv4Topics/GAME")
        .with_header("subscription", "sub-0")
        .with_header("message-id", "T_1@@session-1@@1")
        .with_body(MESSAGE_BODY)
}

fn create_store(markets: usize) -> MarketStateStore {
    let records = (0..markets).map(|i| MarketRecord {
        id: format!("M{i}"),
        ids: MarketIds {
            sport: Some("NFL".to_string()),
            league: Some("3".to_string()),
            game: Some(format!("{}", 47_000_000 + i)),
        },
        outcomes: BTreeMap::from([
            ("home".to_string(), OutcomeQuote::new(Decimal::from(100))),
            ("away".to_string(), OutcomeQuote::new(Decimal::from(-120))),
        ]),
        sequence: 1,
        updated_at: Utc::now(),
    });

    let mut store = MarketStateStore::new(StoreMetrics::new());
    store.apply_snapshot(MarketSnapshot::from_records(records));
    store
}

fn create_delta(market: usize, sequence: u64) -> Delta {
    Delta {
        market_id: format!("M{market}"),
        ids: MarketIds::default(),
        outcomes: BTreeMap::from([(
            "home".to_string(),
            OutcomeQuote::new(Decimal::from(100 + sequence as i64)),
        )]),
        sequence,
        timestamp: Utc::now(),
        live: true,
    }
}

fn bench_decode(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let encoded = codec.encode_frame(&message_frame());

    c.bench_function("decode_message_frame", |b| {
        let mut codec = FrameCodec::default();
        b.iter_batched(
            || BytesMut::from(&encoded[..]),
            |mut buffer| black_box(codec.decode(&mut buffer).unwrap()),
            BatchSize::SmallInput,
        )
    });

    // 50 frames arriving in one chunk, interleaved with heart-beats
    let mut burst = BytesMut::new();
    for _ in 0..50 {
        burst.extend_from_slice(&encoded);
        burst.extend_from_slice(b"\n");
    }
    c.bench_function("decode_burst_50", |b| {
        let mut codec = FrameCodec::default();
        b.iter_batched(
            || burst.clone(),
            |mut buffer| {
                let mut frames = 0;
                while let Ok(Some(_)) = codec.decode(&mut buffer) {
                    frames += 1;
                }
                black_box(frames)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_encode(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let frame = message_frame();

    c.bench_function("encode_message_frame", |b| {
        b.iter(|| black_box(codec.encode_frame(black_box(&frame))))
    });
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_message_body", |b| {
        b.iter(|| black_box(parse_message_body(black_box(MESSAGE_BODY)).unwrap()))
    });
}

fn bench_apply_delta(c: &mut Criterion) {
    c.bench_function("apply_delta", |b| {
        let mut store = create_store(1_000);
        let mut sequence = 1u64;
        b.iter(|| {
            sequence += 1;
            let delta = create_delta((sequence % 1_000) as usize, sequence);
            black_box(store.apply_delta(&delta))
        })
    });

    c.bench_function("apply_stale_delta", |b| {
        let mut store = create_store(1_000);
        let delta = create_delta(7, 1);
        b.iter(|| black_box(store.apply_delta(black_box(&delta))))
    });
}

fn bench_snapshot(c: &mut Criterion) {
    c.bench_function("apply_snapshot_1000", |b| {
        b.iter_batched(
            || {
                let store = create_store(1_000);
                (
                    MarketStateStore::new(StoreMetrics::new()),
                    MarketSnapshot::from_records(store.records()),
                )
            },
            |(mut store, snapshot)| {
                store.apply_snapshot(snapshot);
                black_box(store.len())
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_encode,
    bench_parse,
    bench_apply_delta,
    bench_snapshot
);
criterion_main!(benches);
