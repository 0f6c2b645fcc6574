//! TCP header decoding.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, NetworkEndian};

/// TCP assigned protocol number.
pub const TCP_PROTOCOL: u8 = 6;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

const MIN_HEADER_LEN: usize = 20;

/// Fixed-header fields the engine consumes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpMeta {
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    pub(crate) seq_no: u32,
    pub(crate) flags: u8,
}

/// Decodes a TCP header, returning the fields and the segment payload.
pub(crate) fn parse(bytes: &[u8]) -> Result<(TcpMeta, &[u8])> {
    if bytes.len() < MIN_HEADER_LEN {
        bail!("truncated tcp header");
    }
    let data_offset = ((bytes[12] & 0xF0) >> 4) as usize * 4;
    if data_offset < MIN_HEADER_LEN || bytes.len() < data_offset {
        bail!("bad tcp data offset");
    }
    let meta = TcpMeta {
        src_port: NetworkEndian::read_u16(&bytes[0..2]),
        dst_port: NetworkEndian::read_u16(&bytes[2..4]),
        seq_no: NetworkEndian::read_u32(&bytes[4..8]),
        flags: bytes[13],
    };
    Ok((meta, &bytes[data_offset..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_and_payload() {
        let mut bytes = vec![0u8; 24];
        NetworkEndian::write_u16(&mut bytes[0..2], 40000);
        NetworkEndian::write_u16(&mut bytes[2..4], 80);
        NetworkEndian::write_u32(&mut bytes[4..8], 12345);
        bytes[12] = 5 << 4;
        bytes[13] = SYN | ACK;
        let (meta, payload) = parse(&bytes).unwrap();
        assert_eq!(meta.src_port, 40000);
        assert_eq!(meta.dst_port, 80);
        assert_eq!(meta.seq_no, 12345);
        assert_eq!(meta.flags & SYN, SYN);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn options_are_skipped() {
        let mut bytes = vec![0u8; 32];
        bytes[12] = 7 << 4; // 28-byte header
        let (_, payload) = parse(&bytes).unwrap();
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn bad_data_offset_rejected() {
        let mut bytes = vec![0u8; 20];
        bytes[12] = 4 << 4;
        assert!(parse(&bytes).is_err());
        bytes[12] = 15 << 4;
        assert!(parse(&bytes).is_err());
    }
}
