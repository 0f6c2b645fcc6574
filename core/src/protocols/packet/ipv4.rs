//! IPv4 header decoding.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

use super::{FragMeta, IpCtx, L3Meta};

const MIN_HEADER_LEN: usize = 20;
const MF: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1FFF;

/// Decodes an IPv4 header, returning the fragmentation verdict and the
/// network-layer payload. The payload is bounded by the total-length field;
/// a capture shorter than that is treated as truncated.
pub(crate) fn parse(bytes: &[u8]) -> Result<(L3Meta, &[u8])> {
    if bytes.len() < MIN_HEADER_LEN {
        bail!("truncated ipv4 header");
    }
    if bytes[0] >> 4 != 4 {
        bail!("not ipv4");
    }
    let header_len = ((bytes[0] & 0x0F) as usize) * 4;
    if header_len < MIN_HEADER_LEN {
        bail!("bad ipv4 header length");
    }
    let total_len = NetworkEndian::read_u16(&bytes[2..4]) as usize;
    if total_len < header_len || bytes.len() < total_len {
        bail!("truncated ipv4 packet");
    }

    let ctx = IpCtx {
        src: IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15])),
        dst: IpAddr::V4(Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19])),
        proto: bytes[9],
    };
    let payload = &bytes[header_len..total_len];

    let flags_frag = NetworkEndian::read_u16(&bytes[6..8]);
    let frag_offset = ((flags_frag & FRAG_OFFSET_MASK) as u32) * 8;
    let more = flags_frag & MF != 0;
    if more || frag_offset != 0 {
        let frag = FragMeta {
            id: NetworkEndian::read_u16(&bytes[4..6]) as u32,
            offset: frag_offset,
            more,
        };
        Ok((L3Meta::Fragment(ctx, frag), payload))
    } else {
        Ok((L3Meta::Whole(ctx), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(total_len: u16, id: u16, flags_frag: u16, proto: u8) -> Vec<u8> {
        let mut h = vec![0u8; total_len as usize];
        h[0] = 0x45;
        NetworkEndian::write_u16(&mut h[2..4], total_len);
        NetworkEndian::write_u16(&mut h[4..6], id);
        NetworkEndian::write_u16(&mut h[6..8], flags_frag);
        h[9] = proto;
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[10, 0, 0, 2]);
        h
    }

    #[test]
    fn whole_datagram() {
        let bytes = header(28, 1, 0, 17);
        let (meta, payload) = parse(&bytes).unwrap();
        assert!(matches!(meta, L3Meta::Whole(ctx) if ctx.proto == 17));
        assert_eq!(payload.len(), 8);
    }

    #[test]
    fn first_fragment() {
        let bytes = header(28, 42, MF, 17);
        let (meta, _) = parse(&bytes).unwrap();
        match meta {
            L3Meta::Fragment(_, frag) => {
                assert_eq!(frag.id, 42);
                assert_eq!(frag.offset, 0);
                assert!(frag.more);
            }
            other => panic!("expected fragment, got {:?}", other),
        }
    }

    #[test]
    fn last_fragment_offset_in_bytes() {
        let bytes = header(28, 42, 100, 17);
        let (meta, _) = parse(&bytes).unwrap();
        match meta {
            L3Meta::Fragment(_, frag) => {
                assert_eq!(frag.offset, 800);
                assert!(!frag.more);
            }
            other => panic!("expected fragment, got {:?}", other),
        }
    }

    #[test]
    fn truncated_capture_rejected() {
        let mut bytes = header(28, 1, 0, 17);
        bytes.truncate(24);
        assert!(parse(&bytes).is_err());
    }
}
