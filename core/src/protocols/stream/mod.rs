//! Stream-level protocol identification and inspection.
//!
//! Byte runs surfaced by the transport layer are handed to the dispatcher,
//! which drives the enabled inspectors over them. The first inspector that
//! matches wins and its verdict is cached on the flow; a flow whose trial
//! budget runs out without a match is abandoned. Flows observed without
//! their TCP handshake are treated leniently, since an inspector's
//! rejection may only mean it missed the start of the conversation.

pub mod http;

use bitmask_enum::bitmask;
use strum_macros::EnumString;

use self::http::HttpInspector;
use crate::flowtrack::flow::{Flow, Identification};
use crate::flowtrack::flow_id::Direction;
use crate::flowtrack::pdu::PktInfo;

/// Application-layer protocols the engine can identify.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Protocol {
    /// Not (or not yet) identified.
    Unknown,
    Http,
}

/// Per-packet dissection status. The discriminants are part of the
/// external contract.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    /// The packet could not be processed.
    Error = 0,
    /// The flow's protocol is identified.
    Matches = 1,
    /// Identification was abandoned for this flow.
    NoMatches = 2,
    /// More data is needed before a verdict.
    MoreDataNeeded = 3,
}

/// Result of running one inspector over one byte run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum InspectResult {
    Matches,
    NoMatches,
    MoreDataNeeded,
    Error,
}

/// Set of protocols, for the inspect and active-callback masks.
#[bitmask(u8)]
pub(crate) enum ProtocolMask {
    Http,
}

impl ProtocolMask {
    pub(crate) fn of(proto: Protocol) -> ProtocolMask {
        match proto {
            Protocol::Http => ProtocolMask::Http,
            Protocol::Unknown => ProtocolMask::none(),
        }
    }
}

/// Maps a flow's identification state to the per-packet result.
pub(crate) fn flow_status(flow: &Flow) -> (Protocol, Status) {
    match flow.ident {
        Identification::Known(proto) => (proto, Status::Matches),
        Identification::GiveUp => (Protocol::Unknown, Status::NoMatches),
        Identification::Pending { .. } => (Protocol::Unknown, Status::MoreDataNeeded),
    }
}

/// Drives inspectors over surfaced byte runs and maintains per-flow
/// identification state.
pub(crate) struct Dispatch {
    /// Protocols the engine attempts to identify.
    pub(crate) to_inspect: ProtocolMask,
    /// Protocols with user callbacks attached. An identified flow is only
    /// re-inspected while its protocol's bit is set here.
    pub(crate) active_callbacks: ProtocolMask,
    pub(crate) http: HttpInspector,
}

impl Dispatch {
    pub(crate) fn new(to_inspect: ProtocolMask) -> Self {
        Dispatch {
            to_inspect,
            active_callbacks: ProtocolMask::none(),
            http: HttpInspector::default(),
        }
    }

    /// Processes one in-order byte run for `flow`.
    pub(crate) fn on_data(&mut self, flow: &mut Flow, dir: Direction, pkt: &PktInfo, data: &[u8]) {
        match flow.ident {
            Identification::Known(proto) => {
                if self.active_callbacks.contains(ProtocolMask::of(proto)) {
                    // Re-run the inspector so callbacks fire on subsequent
                    // protocol data units.
                    self.run(proto, flow, dir, pkt, data);
                }
            }
            Identification::GiveUp => {}
            Identification::Pending { trials_left } => {
                let mut candidates = 0u8;
                let mut rejected = 0u8;
                if self.to_inspect.contains(ProtocolMask::Http) {
                    candidates += 1;
                    match self.run(Protocol::Http, flow, dir, pkt, data) {
                        InspectResult::Matches => {
                            flow.ident = Identification::Known(Protocol::Http);
                            return;
                        }
                        InspectResult::NoMatches => rejected += 1,
                        InspectResult::MoreDataNeeded | InspectResult::Error => {}
                    }
                }
                if candidates == 0 || rejected < candidates {
                    return;
                }
                // Every enabled inspector rejected this byte run.
                if !flow.seen_syn {
                    // Joined mid-stream: a rejection may stem from the
                    // missed handshake rather than a true negative.
                    return;
                }
                match trials_left {
                    None => {}
                    Some(n) if n <= 1 => {
                        log::debug!("giving up identification for {}", flow.key);
                        flow.ident = Identification::GiveUp;
                    }
                    Some(n) => {
                        flow.ident = Identification::Pending {
                            trials_left: Some(n - 1),
                        };
                    }
                }
            }
        }
    }

    fn run(
        &mut self,
        proto: Protocol,
        flow: &mut Flow,
        dir: Direction,
        pkt: &PktInfo,
        data: &[u8],
    ) -> InspectResult {
        let callbacks_active = self.active_callbacks.contains(ProtocolMask::of(proto));
        match proto {
            Protocol::Http => self.http.inspect(
                &mut flow.dirs[dir.index()].http,
                flow.seen_syn,
                &mut flow.user_data,
                pkt,
                data,
                callbacks_active,
            ),
            Protocol::Unknown => InspectResult::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowtrack::flow_id::FlowKey;
    use crate::protocols::packet::tcp::TCP_PROTOCOL;

    fn flow(seen_syn: bool, max_trials: u16) -> Flow {
        let (key, _) = FlowKey::from_endpoints(
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
            TCP_PROTOCOL,
        );
        let mut flow = Flow::new(key, 0, max_trials);
        flow.seen_syn = seen_syn;
        flow
    }

    fn pkt() -> PktInfo {
        PktInfo {
            src: "10.0.0.1:40000".parse().unwrap(),
            dst: "10.0.0.2:80".parse().unwrap(),
            l4proto: TCP_PROTOCOL,
            seq_no: 0,
            tcp_flags: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn http_data_identifies_flow() {
        let mut dispatch = Dispatch::new(ProtocolMask::Http);
        let mut flow = flow(true, 4);
        dispatch.on_data(
            &mut flow,
            Direction::AtoB,
            &pkt(),
            b"GET / HTTP/1.1\r\n\r\n",
        );
        assert_eq!(flow.protocol(), Protocol::Http);
        assert_eq!(flow_status(&flow), (Protocol::Http, Status::Matches));
    }

    #[test]
    fn trial_budget_exhaustion_gives_up() {
        // P7: after max_trials rejected runs the flow is abandoned and
        // later data cannot resurrect it.
        let mut dispatch = Dispatch::new(ProtocolMask::Http);
        let mut flow = flow(true, 3);
        for _ in 0..3 {
            dispatch.on_data(&mut flow, Direction::AtoB, &pkt(), b"\x00\x01binary junk");
        }
        assert!(matches!(flow.ident, Identification::GiveUp));
        assert_eq!(flow_status(&flow).1, Status::NoMatches);

        // Valid HTTP afterwards is not even inspected.
        dispatch.on_data(
            &mut flow,
            Direction::AtoB,
            &pkt(),
            b"GET / HTTP/1.1\r\n\r\n",
        );
        assert!(matches!(flow.ident, Identification::GiveUp));
    }

    #[test]
    fn mid_stream_rejections_do_not_consume_trials() {
        let mut dispatch = Dispatch::new(ProtocolMask::Http);
        let mut flow = flow(false, 2);
        for _ in 0..5 {
            dispatch.on_data(&mut flow, Direction::AtoB, &pkt(), b"\x00\x01binary junk");
        }
        assert_eq!(flow_status(&flow).1, Status::MoreDataNeeded);
    }

    #[test]
    fn unlimited_trials_never_give_up() {
        let mut dispatch = Dispatch::new(ProtocolMask::Http);
        let mut flow = flow(true, 0);
        for _ in 0..50 {
            dispatch.on_data(&mut flow, Direction::AtoB, &pkt(), b"\x00\x01binary junk");
        }
        assert_eq!(flow_status(&flow).1, Status::MoreDataNeeded);
    }

    #[test]
    fn nothing_enabled_stays_pending() {
        let mut dispatch = Dispatch::new(ProtocolMask::none());
        let mut flow = flow(true, 1);
        dispatch.on_data(
            &mut flow,
            Direction::AtoB,
            &pkt(),
            b"GET / HTTP/1.1\r\n\r\n",
        );
        assert_eq!(flow_status(&flow).1, Status::MoreDataNeeded);
    }

    #[test]
    fn status_discriminants_are_stable() {
        assert_eq!(Status::Error as u8, 0);
        assert_eq!(Status::Matches as u8, 1);
        assert_eq!(Status::NoMatches as u8, 2);
        assert_eq!(Status::MoreDataNeeded as u8, 3);
    }
}
