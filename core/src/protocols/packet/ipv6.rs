//! IPv6 header decoding, including the extension-header walk.

use std::net::{IpAddr, Ipv6Addr};

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use super::{FragMeta, IpCtx, L3Meta};

const HEADER_LEN: usize = 40;
const NEXT_HOP_BY_HOP: u8 = 0;
const NEXT_ROUTING: u8 = 43;
const NEXT_FRAGMENT: u8 = 44;
const NEXT_DEST_OPTS: u8 = 60;
const FRAGMENT_HEADER_LEN: usize = 8;

/// Decodes an IPv6 fixed header and walks extension headers until the
/// transport protocol (or a Fragment header) is found.
pub(crate) fn parse(bytes: &[u8]) -> Result<(L3Meta, &[u8])> {
    if bytes.len() < HEADER_LEN {
        bail!("truncated ipv6 header");
    }
    if bytes[0] >> 4 != 6 {
        bail!("not ipv6");
    }
    let payload_len = NetworkEndian::read_u16(&bytes[4..6]) as usize;
    if bytes.len() < HEADER_LEN + payload_len {
        bail!("truncated ipv6 packet");
    }
    let src = read_addr(&bytes[8..24]);
    let dst = read_addr(&bytes[24..40]);

    let mut next_header = bytes[6];
    let mut at = HEADER_LEN;
    let end = HEADER_LEN + payload_len;
    loop {
        match next_header {
            NEXT_HOP_BY_HOP | NEXT_ROUTING | NEXT_DEST_OPTS => {
                if at + 2 > end {
                    bail!("truncated ipv6 extension header");
                }
                let ext_len = (bytes[at + 1] as usize + 1) * 8;
                if at + ext_len > end {
                    bail!("truncated ipv6 extension header");
                }
                next_header = bytes[at];
                at += ext_len;
            }
            NEXT_FRAGMENT => {
                if at + FRAGMENT_HEADER_LEN > end {
                    bail!("truncated ipv6 fragment header");
                }
                let offset_flags = NetworkEndian::read_u16(&bytes[at + 2..at + 4]);
                let frag = FragMeta {
                    id: NetworkEndian::read_u32(&bytes[at + 4..at + 8]),
                    offset: ((offset_flags >> 3) as u32) * 8,
                    more: offset_flags & 0x1 != 0,
                };
                let ctx = IpCtx {
                    src,
                    dst,
                    proto: bytes[at],
                };
                return Ok((L3Meta::Fragment(ctx, frag), &bytes[at + FRAGMENT_HEADER_LEN..end]));
            }
            proto => {
                let ctx = IpCtx { src, dst, proto };
                return Ok((L3Meta::Whole(ctx), &bytes[at..end]));
            }
        }
    }
}

fn read_addr(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    IpAddr::V6(Ipv6Addr::from(octets))
}
