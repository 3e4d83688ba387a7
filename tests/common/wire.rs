//! Encoders for the server messages the fake server sends.
//!
//! Each function returns one complete message, tag byte included, laid out
//! exactly as a protocol 34 server writes it.

#![allow(dead_code)] // Each integration crate uses a different subset.

use netchan_client::ServerOp;

fn push_string(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
}

pub fn nop() -> Vec<u8> {
    vec![ServerOp::Nop as u8]
}

pub fn disconnect() -> Vec<u8> {
    vec![ServerOp::Disconnect as u8]
}

pub fn reconnect() -> Vec<u8> {
    vec![ServerOp::Reconnect as u8]
}

pub fn print(level: u8, text: &str) -> Vec<u8> {
    let mut out = vec![ServerOp::Print as u8, level];
    push_string(&mut out, text);
    out
}

pub fn stuff_text(text: &str) -> Vec<u8> {
    let mut out = vec![ServerOp::StuffText as u8];
    push_string(&mut out, text);
    out
}

pub fn server_data(server_count: i32, player_num: i16, level_name: &str) -> Vec<u8> {
    let mut out = vec![ServerOp::ServerData as u8];
    out.extend_from_slice(&34i32.to_le_bytes());
    out.extend_from_slice(&server_count.to_le_bytes());
    out.push(0);
    push_string(&mut out, "baseq2");
    out.extend_from_slice(&player_num.to_le_bytes());
    push_string(&mut out, level_name);
    out
}

pub fn config_string(index: u16, text: &str) -> Vec<u8> {
    let mut out = vec![ServerOp::ConfigString as u8];
    out.extend_from_slice(&index.to_le_bytes());
    push_string(&mut out, text);
    out
}

pub fn frame(server_frame: i32) -> Vec<u8> {
    let mut out = vec![ServerOp::Frame as u8];
    out.extend_from_slice(&server_frame.to_le_bytes());
    out.extend_from_slice(&(server_frame - 1).to_le_bytes());
    out.push(0); // suppress count
    out.push(0); // no area bits
    out
}

/// Player info carrying only the movement type and no stats.
pub fn player_info(move_type: u8) -> Vec<u8> {
    let mut out = vec![ServerOp::PlayerInfo as u8];
    out.extend_from_slice(&1u16.to_le_bytes());
    out.push(move_type);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// A full (non-delta) snapshot naming `entities` without field updates.
pub fn packet_entities(entities: &[u8]) -> Vec<u8> {
    let mut out = vec![ServerOp::PacketEntities as u8];
    for &number in entities {
        out.extend_from_slice(&[0, number]);
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// A datagram from the server: two sequence words then the messages.
pub fn datagram(seq_a: u32, seq_b: u32, messages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&seq_a.to_le_bytes());
    out.extend_from_slice(&seq_b.to_le_bytes());
    for message in messages {
        out.extend_from_slice(message);
    }
    out
}

/// A connectionless datagram.
pub fn connectionless(text: &str) -> Vec<u8> {
    let mut out = u32::MAX.to_le_bytes().to_vec();
    out.extend_from_slice(text.as_bytes());
    out
}
