//! Decoded per-packet transport context.

use std::net::SocketAddr;

/// Decoded L3/L4 context of one packet, produced once per input packet and
/// immutable downstream. Inspection callbacks receive it alongside the
/// extracted data.
#[derive(Debug, Clone, Copy)]
pub struct PktInfo {
    /// Source socket address.
    pub src: SocketAddr,
    /// Destination socket address.
    pub dst: SocketAddr,
    /// L4 protocol number.
    pub l4proto: u8,
    /// Raw TCP sequence number; zero for UDP.
    pub seq_no: u32,
    /// TCP flags; zero for UDP.
    pub tcp_flags: u8,
    /// Capture timestamp in seconds. All engine timeouts are evaluated
    /// against this clock, not wall-clock time.
    pub timestamp: u64,
}
