//! Flow-key hash functions.
//!
//! Four interchangeable hashes over the canonical key bytes. All of them
//! are deterministic and, because the key itself is canonicalised, invariant
//! under swapping the endpoints. The choice is a runtime configuration
//! option; the selected function is injected into the flow table as a plain
//! function value.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use strum_macros::EnumString;

use super::flow_id::FlowKey;

/// Selects the flow-table hash function.
#[derive(Debug, Copy, Clone, Eq, PartialEq, EnumString, Deserialize, Serialize, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HashChoice {
    #[default]
    Simple,
    Fnv,
    Murmur3,
    Bkdr,
}

pub(crate) type HashFn = fn(&FlowKey) -> u32;

pub(crate) fn select(choice: HashChoice) -> HashFn {
    match choice {
        HashChoice::Simple => simple_hash,
        HashChoice::Fnv => fnv1a_hash,
        HashChoice::Murmur3 => murmur3_hash,
        HashChoice::Bkdr => bkdr_hash,
    }
}

/// Largest key serialisation: two IPv6 endpoints, two ports, one protocol.
const KEY_BYTES_MAX: usize = 37;

fn put_addr(buf: &mut [u8; KEY_BYTES_MAX], at: usize, addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(a) => {
            let octets = a.ip().octets();
            buf[at..at + octets.len()].copy_from_slice(&octets);
            at + octets.len()
        }
        SocketAddr::V6(a) => {
            let octets = a.ip().octets();
            buf[at..at + octets.len()].copy_from_slice(&octets);
            at + octets.len()
        }
    }
}

fn key_bytes(key: &FlowKey) -> ([u8; KEY_BYTES_MAX], usize) {
    let mut buf = [0u8; KEY_BYTES_MAX];
    let mut at = put_addr(&mut buf, 0, &key.a);
    at = put_addr(&mut buf, at, &key.b);
    buf[at..at + 2].copy_from_slice(&key.a.port().to_be_bytes());
    buf[at + 2..at + 4].copy_from_slice(&key.b.port().to_be_bytes());
    buf[at + 4] = key.proto;
    (buf, at + 5)
}

/// One-at-a-time byte mixer.
fn simple_hash(key: &FlowKey) -> u32 {
    let (buf, len) = key_bytes(key);
    let mut h: u32 = 0;
    for &b in &buf[..len] {
        h = h.wrapping_add(b as u32);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// FNV-1a, 32-bit.
fn fnv1a_hash(key: &FlowKey) -> u32 {
    let (buf, len) = key_bytes(key);
    let mut h: u32 = 0x811c_9dc5;
    for &b in &buf[..len] {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// MurmurHash3, 32-bit, fixed seed.
fn murmur3_hash(key: &FlowKey) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let (buf, len) = key_bytes(key);
    let data = &buf[..len];
    let mut h = SEED;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in rem.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= len as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// BKDR string hash, seed 131.
fn bkdr_hash(key: &FlowKey) -> u32 {
    let (buf, len) = key_bytes(key);
    let mut h: u32 = 0;
    for &b in &buf[..len] {
        h = h.wrapping_mul(131).wrapping_add(b as u32);
    }
    h
}
