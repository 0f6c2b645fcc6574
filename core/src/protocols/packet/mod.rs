//! Packet-level header decoding.
//!
//! Minimal slice-based decoders for the layers the engine consumes: enough
//! of L2 to find the network header, the IP fragmentation fields, and the
//! transport 4-tuple. Truncated or inconsistent headers fail the decode and
//! drop the packet without touching flow state.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::net::IpAddr;

/// Network-layer context carried alongside a decoded payload, and stored
/// with in-flight fragment reassembly so a completed datagram can resume
/// transport decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCtx {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol number.
    pub proto: u8,
}

/// Fragmentation fields of one IP fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragMeta {
    /// Datagram identification.
    pub id: u32,
    /// Byte offset of this fragment within the reassembled payload.
    pub offset: u32,
    /// More-fragments flag.
    pub more: bool,
}

/// Outcome of decoding the network layer of one frame.
#[derive(Debug)]
pub enum L3Meta {
    /// A complete datagram.
    Whole(IpCtx),
    /// One fragment of a larger datagram.
    Fragment(IpCtx, FragMeta),
}
