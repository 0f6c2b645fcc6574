//! UDP header decoding.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

/// UDP assigned protocol number.
pub const UDP_PROTOCOL: u8 = 17;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct UdpMeta {
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
}

/// Decodes a UDP header, returning the ports and the datagram payload.
pub(crate) fn parse(bytes: &[u8]) -> Result<(UdpMeta, &[u8])> {
    if bytes.len() < HEADER_LEN {
        bail!("truncated udp header");
    }
    let length = NetworkEndian::read_u16(&bytes[4..6]) as usize;
    if length < HEADER_LEN || bytes.len() < length {
        bail!("bad udp length");
    }
    let meta = UdpMeta {
        src_port: NetworkEndian::read_u16(&bytes[0..2]),
        dst_port: NetworkEndian::read_u16(&bytes[2..4]),
    };
    Ok((meta, &bytes[HEADER_LEN..length]))
}
