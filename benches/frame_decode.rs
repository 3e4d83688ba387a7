//! Benchmarks for the receive path
//!
//! Run with: cargo bench --bench frame_decode
//!
//! Decodes server datagrams shaped like real traffic (an in-game frame with
//! player state and a crowded entity snapshot, and a level-load datagram
//! full of config strings) and applies them to a world.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netchan_client::{
    Action, ClientPayload, GameState, MessageCatalog, MoveCommand, SequenceNumber, ServerFrame,
    ServerOp, WireFrame, World,
};
use std::hint::black_box;

fn header(out: &mut Vec<u8>, seq_a: u32) {
    out.extend_from_slice(&seq_a.to_le_bytes());
    out.extend_from_slice(&seq_a.to_le_bytes());
}

/// An in-game frame naming `entities` entities, each with a moved origin.
fn game_frame(entities: u16) -> Vec<u8> {
    let mut out = Vec::new();
    header(&mut out, 100);

    out.push(ServerOp::Frame as u8);
    out.extend_from_slice(&100i32.to_le_bytes());
    out.extend_from_slice(&99i32.to_le_bytes());
    out.extend_from_slice(&[0, 0]);

    out.push(ServerOp::PlayerInfo as u8);
    // Movement type, origin and view angles.
    out.extend_from_slice(&(1u16 | 1 << 1 | 1 << 8).to_le_bytes());
    out.push(0);
    for axis in [128i16, -64, 24] {
        out.extend_from_slice(&axis.to_le_bytes());
    }
    for angle in [0i16, 16384, 0] {
        out.extend_from_slice(&angle.to_le_bytes());
    }
    out.extend_from_slice(&0b111u32.to_le_bytes());
    for stat in [100i16, 50, 25] {
        out.extend_from_slice(&stat.to_le_bytes());
    }

    out.push(ServerOp::PacketEntities as u8);
    for number in 1..=entities {
        // Origin x and y, plus the 16-bit entity number.
        let bits = 1u8 | 1 << 1 | 1 << 7;
        out.push(bits);
        out.push(1); // second byte: U_NUMBER16
        out.extend_from_slice(&number.to_le_bytes());
        out.extend_from_slice(&(number as i16 * 8).to_le_bytes());
        out.extend_from_slice(&(-(number as i16) * 8).to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// A level-load datagram carrying `count` config strings.
fn config_strings(count: u16) -> Vec<u8> {
    let mut out = Vec::new();
    header(&mut out, 3 | 1 << 31);
    for index in 0..count {
        out.push(ServerOp::ConfigString as u8);
        out.extend_from_slice(&(32 + index).to_le_bytes());
        out.extend_from_slice(format!("models/items/item{index}.md2").as_bytes());
        out.push(0);
    }
    out
}

fn bench_decode(c: &mut Criterion) {
    let catalog = MessageCatalog::standard();
    let mut group = c.benchmark_group("decode");

    for entities in [8u16, 64, 256] {
        let datagram = game_frame(entities);
        group.throughput(Throughput::Bytes(datagram.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("game_frame", entities),
            &datagram,
            |b, datagram| b.iter(|| ServerFrame::decode(black_box(datagram), &catalog)),
        );
    }

    let datagram = config_strings(40);
    group.throughput(Throughput::Bytes(datagram.len() as u64));
    group.bench_function("config_strings", |b| {
        b.iter(|| ServerFrame::decode(black_box(&datagram), &catalog));
    });

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let catalog = MessageCatalog::standard();
    let mut group = c.benchmark_group("apply");

    for entities in [8u16, 64, 256] {
        let Ok(frame) = ServerFrame::decode(&game_frame(entities), &catalog) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::new("game_frame", entities), &frame, |b, frame| {
            let mut world = GameState::default();
            b.iter(|| {
                for decoded in &frame.messages {
                    world.apply(black_box(&decoded.message));
                }
            });
        });
    }

    group.finish();
}

fn bench_encode_move(c: &mut Criterion) {
    let command = MoveCommand::new([0.0, 90.0, 0.0], [200.0, 0.0, 0.0], Action::attack());
    c.bench_function("encode_move_frame", |b| {
        b.iter(|| {
            let payload = ClientPayload::Move(command.to_payload(black_box(1234), 16));
            WireFrame::client(
                SequenceNumber::new(500, false),
                SequenceNumber::new(1234, true),
                std::slice::from_ref(&payload),
            )
            .map(|frame| frame.encode())
        });
    });
}

criterion_group!(benches, bench_decode, bench_apply, bench_encode_move);
criterion_main!(benches);
