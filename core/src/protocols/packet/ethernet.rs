//! Ethernet frame decoding.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;

/// Strips the Ethernet header (and a single 802.1Q tag, if present),
/// returning the ethertype and the network-layer payload.
pub(crate) fn strip(frame: &[u8]) -> Result<(u16, &[u8])> {
    if frame.len() < HEADER_LEN {
        bail!("truncated ethernet header");
    }
    let ethertype = NetworkEndian::read_u16(&frame[12..14]);
    if ethertype != ETHERTYPE_VLAN {
        return Ok((ethertype, &frame[HEADER_LEN..]));
    }
    if frame.len() < HEADER_LEN + VLAN_TAG_LEN {
        bail!("truncated vlan tag");
    }
    let inner = NetworkEndian::read_u16(&frame[16..18]);
    Ok((inner, &frame[HEADER_LEN + VLAN_TAG_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame() {
        let mut frame = vec![0u8; 20];
        frame[12] = 0x08;
        frame[13] = 0x00;
        let (ethertype, payload) = strip(&frame).unwrap();
        assert_eq!(ethertype, ETHERTYPE_IPV4);
        assert_eq!(payload.len(), 6);
    }

    #[test]
    fn vlan_tagged_frame() {
        let mut frame = vec![0u8; 24];
        frame[12] = 0x81;
        frame[13] = 0x00;
        frame[16] = 0x86;
        frame[17] = 0xDD;
        let (ethertype, payload) = strip(&frame).unwrap();
        assert_eq!(ethertype, ETHERTYPE_IPV6);
        assert_eq!(payload.len(), 6);
    }

    #[test]
    fn short_frame_rejected() {
        assert!(strip(&[0u8; 10]).is_err());
    }
}
