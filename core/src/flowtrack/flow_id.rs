//! Canonical flow identifiers.
//!
//! A flow is a bidirectional conversation; its key orders the two endpoints
//! canonically so that a packet and its reverse resolve to the same key. The
//! direction a packet travels is recovered by comparing its source against
//! the canonical order.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Canonicalised 5-tuple identifying a bidirectional flow.
///
/// The endpoint with the smaller (address, port) pair is always `a`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    /// The endpoint that compares smaller.
    pub a: SocketAddr,
    /// The endpoint that compares larger.
    pub b: SocketAddr,
    /// The layer-4 protocol.
    pub proto: u8,
}

/// Packet direction relative to the canonical endpoint order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// The packet's source is endpoint `a`.
    AtoB = 0,
    /// The packet's source is endpoint `b`.
    BtoA = 1,
}

impl Direction {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl FlowKey {
    /// Builds the canonical key for a packet, returning the direction the
    /// packet travels relative to it.
    pub fn from_endpoints(src: SocketAddr, dst: SocketAddr, proto: u8) -> (Self, Direction) {
        let a = cmp::min(src, dst);
        let b = cmp::max(src, dst);
        let dir = if src == a {
            Direction::AtoB
        } else {
            Direction::BtoA
        };
        (FlowKey { a, b, proto }, dir)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {} protocol {}", self.a, self.b, self.proto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn reverse_packet_maps_to_same_key() {
        // P5: a packet and its reverse share a key and differ in direction.
        let src = addr("192.168.0.1:51000");
        let dst = addr("10.0.0.1:80");
        let (k1, d1) = FlowKey::from_endpoints(src, dst, 6);
        let (k2, d2) = FlowKey::from_endpoints(dst, src, 6);
        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
    }

    #[test]
    fn smaller_endpoint_is_a() {
        let lo = addr("10.0.0.1:80");
        let hi = addr("192.168.0.1:51000");
        let (key, dir) = FlowKey::from_endpoints(hi, lo, 6);
        assert_eq!(key.a, lo);
        assert_eq!(key.b, hi);
        assert_eq!(dir, Direction::BtoA);
    }

    #[test]
    fn same_addr_different_ports() {
        let lo = addr("10.0.0.1:80");
        let hi = addr("10.0.0.1:8080");
        let (key, dir) = FlowKey::from_endpoints(lo, hi, 6);
        assert_eq!(key.a, lo);
        assert_eq!(dir, Direction::AtoB);
    }
}
