//! Per-direction TCP stream reassembly.
//!
//! Tracks the next expected sequence number for one direction of a flow and
//! surfaces payload bytes to the caller strictly in stream order. Out-of-order
//! segments are parked in a [`FragmentList`](super::FragmentList) until the
//! gap before them fills; the reassembler never blocks and never fabricates
//! bytes.

use crate::protocols::packet::tcp::{FIN, SYN};
use crate::reassembly::{seq_before, FragmentList};

#[derive(Debug, Default)]
pub(crate) struct TcpDirState {
    /// Sequence number of the next expected payload byte. `None` until the
    /// first segment in this direction is seen; a mid-stream join starts
    /// from that segment's own sequence number.
    expected_seq: Option<u32>,
    /// Segments parked past a gap. Every node starts at or after
    /// `expected_seq`; earlier bytes have already been surfaced.
    frags: FragmentList,
}

impl TcpDirState {
    #[cfg(test)]
    pub(crate) fn expected_seq(&self) -> Option<u32> {
        self.expected_seq
    }

    #[cfg(test)]
    pub(crate) fn parked_segments(&self) -> usize {
        self.frags.len()
    }

    /// Feeds one segment, invoking `sink` with every byte run that becomes
    /// contiguous with the stream.
    pub(crate) fn process<F: FnMut(&[u8])>(
        &mut self,
        seq: u32,
        flags: u8,
        payload: &[u8],
        mut sink: F,
    ) {
        // A SYN consumes one sequence unit; any payload it carries starts
        // one past the sequence number in the header.
        let data_seq = if flags & SYN != 0 {
            seq.wrapping_add(1)
        } else {
            seq
        };
        let exp = match self.expected_seq {
            Some(exp) => exp,
            None => {
                self.expected_seq = Some(data_seq);
                data_seq
            }
        };
        let fin = flags & FIN != 0;
        let mut data_seq = data_seq;
        let mut payload = payload;
        let seg_end = data_seq.wrapping_add(payload.len() as u32);

        // Entirely old data.
        if seq_before(seg_end, exp) {
            log::debug!("dropping old segment, end {} expected {}", seg_end, exp);
            return;
        }
        // Partially old data: keep only the bytes past the expected
        // sequence number.
        if seq_before(data_seq, exp) {
            let overlap = exp.wrapping_sub(data_seq) as usize;
            if overlap >= payload.len() {
                // No new bytes; a bare duplicate FIN is ignored.
                return;
            }
            payload = &payload[overlap..];
            data_seq = exp;
        }

        if data_seq == exp && self.frags.is_empty() {
            if !payload.is_empty() {
                sink(payload);
            }
            let mut next = exp.wrapping_add(payload.len() as u32);
            if fin {
                next = next.wrapping_add(1);
            }
            self.expected_seq = Some(next);
            return;
        }

        if !payload.is_empty() {
            self.frags.insert(data_seq, payload, fin);
        }

        // Drain everything that now lines up with the stream.
        let mut exp = exp;
        while let Some(frag) = self.frags.pop_head_at(exp) {
            sink(&frag.data);
            exp = frag.end;
            if frag.fin {
                exp = exp.wrapping_add(1);
            }
        }
        self.expected_seq = Some(exp);
    }
}
