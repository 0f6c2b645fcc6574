//! A passive deep-packet-inspection engine.
//!
//! `weir-core` consumes a stream of captured packets and produces, per
//! packet, an identification of the application-layer protocol together
//! with structured fields extracted from it. Three subsystems do the heavy
//! lifting:
//!
//! - **Flow tracking** — a hashed flow table demultiplexes packets into
//!   bidirectional conversations and keeps per-flow state.
//! - **Reassembly** — IPv4/IPv6 fragments and out-of-order TCP segments
//!   are reconstructed with a shared ordered-fragment-list structure, with
//!   memory caps and timer-driven expiry.
//! - **Stateful inspection** — per-flow inspectors run over the
//!   reassembled byte streams and invoke user callbacks on extracted
//!   fields (HTTP URL, headers, body).
//!
//! The engine is synchronous and single-threaded: every call does a
//! bounded amount of work driven by one input packet, and all timeouts are
//! evaluated lazily against packet timestamps.
//!
//! ```no_run
//! use weir_core::config::default_config;
//! use weir_core::{Engine, HttpCallbacks, HttpHeaderEntry};
//!
//! let mut engine = Engine::new(default_config()).unwrap();
//! engine
//!     .http_activate_callbacks(HttpCallbacks {
//!         url: Some(Box::new(|url, _pkt, _flow_data| {
//!             println!("url: {}", String::from_utf8_lossy(url));
//!         })),
//!         headers: vec![HttpHeaderEntry {
//!             name: "host".to_string(),
//!             hook: Box::new(|_info, value, _pkt, _flow_data| {
//!                 println!("host: {}", String::from_utf8_lossy(value));
//!             }),
//!         }],
//!         body: None,
//!     })
//!     .unwrap();
//!
//! // frame/timestamp come from the capture layer.
//! # let (frame, timestamp): (Vec<u8>, u64) = (vec![], 0);
//! let result = engine.dissect(&frame, timestamp);
//! println!("{:?} {:?}", result.status, result.protocol);
//! ```

pub mod config;
pub mod flowtrack;
pub mod protocols;
mod reassembly;

use std::mem;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::{EngineConfig, LinkType};
use crate::flowtrack::flow::FlowUserData;
use crate::flowtrack::FlowTable;
use crate::protocols::packet::ethernet::{self, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::protocols::packet::tcp::{self, SYN, TCP_PROTOCOL};
use crate::protocols::packet::udp::{self, UDP_PROTOCOL};
use crate::protocols::packet::{ipv4, ipv6, IpCtx, L3Meta};
use crate::protocols::stream::{flow_status, Dispatch, ProtocolMask};
use crate::reassembly::ip::IpDefrag;

pub use crate::flowtrack::flow::Flow;
pub use crate::flowtrack::flow_id::{Direction, FlowKey};
pub use crate::flowtrack::pdu::PktInfo;
pub use crate::flowtrack::FlowCleaner;
pub use crate::protocols::stream::http::{
    HttpBodyHook, HttpCallbacks, HttpHeaderEntry, HttpHeaderHook, HttpUrlHook, MessageInfo,
    MessageKind, Method, MethodOrStatus, MAX_HEADER_HOOKS,
};
pub use crate::protocols::stream::{Protocol, Status};

/// Engine-level error kinds. Everything recoverable is reported through
/// the per-packet [`DissectionResult::status`]; `Err` returns from the
/// control surface indicate invalid configuration.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("configuration value out of range: {0}")]
    InvalidArgument(&'static str),
    #[error("memory limit reached, work item dropped")]
    ResourceExhausted,
    #[error("truncated or inconsistent packet header")]
    MalformedPacket,
    #[error("compacted fragment train does not match the expected length")]
    CompactionLengthMismatch,
}

/// Per-packet outcome of [`Engine::dissect`].
#[derive(Debug)]
pub struct DissectionResult {
    pub status: Status,
    /// The flow's identified protocol, or `Unknown`.
    pub protocol: Protocol,
    /// Key of the flow the packet belongs to, when one exists.
    pub flow: Option<FlowKey>,
}

impl DissectionResult {
    fn error() -> Self {
        DissectionResult {
            status: Status::Error,
            protocol: Protocol::Unknown,
            flow: None,
        }
    }

    fn pending() -> Self {
        DissectionResult {
            status: Status::MoreDataNeeded,
            protocol: Protocol::Unknown,
            flow: None,
        }
    }
}

/// The engine state: flow table, defragmentation tables, and inspector
/// dispatch. Construct once with [`Engine::new`] and feed every captured
/// packet through [`Engine::dissect`] (or [`Engine::dissect_ip`] for
/// captures without a link layer).
///
/// All entry points take `&mut self`; callers running multiple capture
/// threads keep one engine per thread.
pub struct Engine {
    link_type: LinkType,
    table: FlowTable,
    defrag_v4: IpDefrag,
    defrag_v6: IpDefrag,
    ipv4_reassembly: bool,
    ipv6_reassembly: bool,
    tcp_reassembly: bool,
    dispatch: Dispatch,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        if config.flow_table.max_flows == 0 {
            return Err(EngineError::InvalidArgument("max_flows must be nonzero"));
        }
        if config.flow_table.buckets == Some(0) {
            return Err(EngineError::InvalidArgument("buckets must be nonzero"));
        }
        let mut to_inspect = ProtocolMask::none();
        if config.protocols.is_empty() {
            to_inspect = ProtocolMask::all();
        } else {
            for name in &config.protocols {
                let proto: Protocol = name
                    .parse()
                    .map_err(|_| EngineError::InvalidArgument("unknown protocol name"))?;
                to_inspect |= ProtocolMask::of(proto);
            }
        }
        Ok(Engine {
            link_type: config.link_type,
            table: FlowTable::new(&config.flow_table, config.max_trials),
            defrag_v4: IpDefrag::new(&config.ipv4_reassembly),
            defrag_v6: IpDefrag::new(&config.ipv6_reassembly),
            ipv4_reassembly: config.ipv4_reassembly.enabled,
            ipv6_reassembly: config.ipv6_reassembly.enabled,
            tcp_reassembly: config.tcp_reassembly,
            dispatch: Dispatch::new(to_inspect),
        })
    }

    /// Dissects one captured frame, starting at the link layer.
    pub fn dissect(&mut self, frame: &[u8], timestamp: u64) -> DissectionResult {
        let outcome = match self.link_type {
            LinkType::Ethernet => match ethernet::strip(frame) {
                Ok((ETHERTYPE_IPV4, l3)) => self.dissect_l3(l3, true, timestamp),
                Ok((ETHERTYPE_IPV6, l3)) => self.dissect_l3(l3, false, timestamp),
                Ok(_) => Err(EngineError::MalformedPacket),
                Err(e) => {
                    log::debug!("link decode failed: {}", e);
                    Err(EngineError::MalformedPacket)
                }
            },
            LinkType::RawIp => self.dissect_raw_ip(frame, timestamp),
        };
        outcome.unwrap_or_else(|e| {
            log::debug!("packet dropped: {}", e);
            DissectionResult::error()
        })
    }

    /// Dissects one packet starting at the IP header.
    pub fn dissect_ip(&mut self, packet: &[u8], timestamp: u64) -> DissectionResult {
        self.dissect_raw_ip(packet, timestamp)
            .unwrap_or_else(|e| {
                log::debug!("packet dropped: {}", e);
                DissectionResult::error()
            })
    }

    fn dissect_raw_ip(
        &mut self,
        packet: &[u8],
        timestamp: u64,
    ) -> Result<DissectionResult, EngineError> {
        match packet.first().map(|b| b >> 4) {
            Some(4) => self.dissect_l3(packet, true, timestamp),
            Some(6) => self.dissect_l3(packet, false, timestamp),
            _ => Err(EngineError::MalformedPacket),
        }
    }

    fn dissect_l3(
        &mut self,
        l3: &[u8],
        is_v4: bool,
        timestamp: u64,
    ) -> Result<DissectionResult, EngineError> {
        // Reassembly timeouts are evaluated lazily, on every packet.
        self.defrag_v4.expire(timestamp);
        self.defrag_v6.expire(timestamp);

        let parsed = if is_v4 { ipv4::parse(l3) } else { ipv6::parse(l3) };
        let (meta, payload) = parsed.map_err(|e| {
            log::debug!("network decode failed: {}", e);
            EngineError::MalformedPacket
        })?;
        match meta {
            L3Meta::Whole(ctx) => self.process_l4(ctx, payload, timestamp),
            L3Meta::Fragment(ctx, frag) => {
                let enabled = if is_v4 {
                    self.ipv4_reassembly
                } else {
                    self.ipv6_reassembly
                };
                if !enabled {
                    log::debug!("fragment dropped, reassembly disabled");
                    return Ok(DissectionResult::error());
                }
                let defrag = if is_v4 {
                    &mut self.defrag_v4
                } else {
                    &mut self.defrag_v6
                };
                match defrag.process(ctx, frag, payload, timestamp)? {
                    Some((ctx, datagram)) => self.process_l4(ctx, &datagram, timestamp),
                    None => Ok(DissectionResult::pending()),
                }
            }
        }
    }

    fn process_l4(
        &mut self,
        ctx: IpCtx,
        bytes: &[u8],
        timestamp: u64,
    ) -> Result<DissectionResult, EngineError> {
        let (pkt, payload) = match ctx.proto {
            TCP_PROTOCOL => {
                let (meta, payload) = tcp::parse(bytes).map_err(|e| {
                    log::debug!("transport decode failed: {}", e);
                    EngineError::MalformedPacket
                })?;
                (
                    PktInfo {
                        src: SocketAddr::new(ctx.src, meta.src_port),
                        dst: SocketAddr::new(ctx.dst, meta.dst_port),
                        l4proto: TCP_PROTOCOL,
                        seq_no: meta.seq_no,
                        tcp_flags: meta.flags,
                        timestamp,
                    },
                    payload,
                )
            }
            UDP_PROTOCOL => {
                let (meta, payload) = udp::parse(bytes).map_err(|e| {
                    log::debug!("transport decode failed: {}", e);
                    EngineError::MalformedPacket
                })?;
                (
                    PktInfo {
                        src: SocketAddr::new(ctx.src, meta.src_port),
                        dst: SocketAddr::new(ctx.dst, meta.dst_port),
                        l4proto: UDP_PROTOCOL,
                        seq_no: 0,
                        tcp_flags: 0,
                        timestamp,
                    },
                    payload,
                )
            }
            other => {
                log::debug!("unsupported transport protocol {}", other);
                return Err(EngineError::MalformedPacket);
            }
        };

        let (flow, dir) = self
            .table
            .get_or_create(pkt.src, pkt.dst, pkt.l4proto, timestamp)?;
        flow.last_seen = timestamp;
        flow.packets_seen += 1;
        if pkt.tcp_flags & SYN != 0 {
            flow.seen_syn = true;
        }

        let dispatch = &mut self.dispatch;
        if pkt.l4proto == TCP_PROTOCOL && self.tcp_reassembly {
            let mut tcp_state = mem::take(&mut flow.dirs[dir.index()].tcp);
            tcp_state.process(pkt.seq_no, pkt.tcp_flags, payload, |run| {
                dispatch.on_data(flow, dir, &pkt, run);
            });
            flow.dirs[dir.index()].tcp = tcp_state;
        } else if !payload.is_empty() {
            dispatch.on_data(flow, dir, &pkt, payload);
        }

        let (protocol, status) = flow_status(flow);
        Ok(DissectionResult {
            status,
            protocol,
            flow: Some(flow.key),
        })
    }

    /* ----------------------------- control surface ----------------------------- */

    /// Sets the identification trial budget for flows created from now on.
    /// `0` means unlimited.
    pub fn set_max_trials(&mut self, max_trials: u16) {
        self.table.set_max_trials(max_trials);
    }

    /// Adds `proto` to the set of inspected protocols.
    pub fn enable_protocol(&mut self, proto: Protocol) {
        self.dispatch.to_inspect |= ProtocolMask::of(proto);
    }

    /// Removes `proto` from the set of inspected protocols.
    pub fn disable_protocol(&mut self, proto: Protocol) {
        self.dispatch.to_inspect &= !ProtocolMask::of(proto);
    }

    /// Installs a callback invoked with the user-data slot of every flow
    /// the table evicts.
    pub fn set_flow_cleaner<F>(&mut self, cleaner: F)
    where
        F: FnMut(FlowUserData) + 'static,
    {
        self.table.set_cleaner(Box::new(cleaner));
    }

    /// Activates HTTP field extraction.
    ///
    /// Enables HTTP inspection and keeps inspecting identified HTTP flows
    /// so the hooks fire on every message. Data passed to hooks is valid
    /// only for the duration of the call. Fails when more than
    /// [`MAX_HEADER_HOOKS`] header hooks are configured.
    pub fn http_activate_callbacks(&mut self, callbacks: HttpCallbacks) -> Result<(), EngineError> {
        if callbacks.headers.len() > MAX_HEADER_HOOKS {
            return Err(EngineError::InvalidArgument("too many header hooks"));
        }
        self.dispatch.to_inspect |= ProtocolMask::Http;
        self.dispatch.active_callbacks |= ProtocolMask::Http;
        self.dispatch.http.callbacks = Some(callbacks);
        Ok(())
    }

    /// Drops the HTTP callback table. Identified HTTP flows stop being
    /// re-inspected; user-owned data is not touched. Idempotent.
    pub fn http_disable_callbacks(&mut self) {
        self.dispatch.active_callbacks &= !ProtocolMask::Http;
        self.dispatch.http.callbacks = None;
    }

    /// Enables or disables TCP stream reassembly.
    pub fn set_tcp_reassembly(&mut self, enabled: bool) {
        self.tcp_reassembly = enabled;
    }

    /// Enables or disables IPv4 defragmentation.
    pub fn set_ipv4_reassembly(&mut self, enabled: bool) {
        self.ipv4_reassembly = enabled;
    }

    /// Enables or disables IPv6 defragmentation.
    pub fn set_ipv6_reassembly(&mut self, enabled: bool) {
        self.ipv6_reassembly = enabled;
    }

    /// Adjusts the IPv4 reassembly memory caps.
    pub fn set_ipv4_memory_limits(&mut self, per_host: usize, total: usize) {
        self.defrag_v4.set_memory_limits(per_host, total);
    }

    /// Adjusts the IPv6 reassembly memory caps.
    pub fn set_ipv6_memory_limits(&mut self, per_host: usize, total: usize) {
        self.defrag_v6.set_memory_limits(per_host, total);
    }

    /// Adjusts the IPv4 reassembly timeout, in seconds. Deadlines of
    /// in-flight reassemblies shift to the new timeout.
    pub fn set_ipv4_reassembly_timeout(&mut self, timeout: u64) {
        self.defrag_v4.set_timeout(timeout);
    }

    /// Adjusts the IPv6 reassembly timeout, in seconds. Deadlines of
    /// in-flight reassemblies shift to the new timeout.
    pub fn set_ipv6_reassembly_timeout(&mut self, timeout: u64) {
        self.defrag_v6.set_timeout(timeout);
    }

    /// Adjusts the flow idle timeout, in seconds.
    pub fn set_flow_idle_timeout(&mut self, timeout: u64) {
        self.table.set_idle_timeout(timeout);
    }

    /// Adjusts the maximum number of tracked flows.
    pub fn set_max_flows(&mut self, max_flows: usize) {
        self.table.set_max_flows(max_flows);
    }

    /// Number of flows currently tracked.
    pub fn flows(&self) -> usize {
        self.table.len()
    }

    /// Bytes currently parked in IPv4 reassembly.
    pub fn ipv4_reassembly_memory(&self) -> usize {
        self.defrag_v4.total_memory()
    }

    /// Bytes currently parked in IPv6 reassembly.
    pub fn ipv6_reassembly_memory(&self) -> usize {
        self.defrag_v6.total_memory()
    }

    /// Removes idle flows, invoking the flow cleaner for each. Returns the
    /// number of flows removed.
    pub fn sweep(&mut self, now: u64) -> usize {
        self.table.sweep(now)
    }

    /// Drains the whole flow table, invoking the flow cleaner for every
    /// flow.
    pub fn flush(&mut self) {
        self.table.flush();
    }

    /// Deletes one flow, invoking the flow cleaner.
    pub fn delete_flow(&mut self, key: &FlowKey) -> bool {
        self.table.delete(key)
    }

    /// Mutable access to a flow's user-data slot.
    pub fn flow_user_data_mut(&mut self, key: &FlowKey) -> Option<&mut FlowUserData> {
        self.table.get_mut(key).map(|flow| &mut flow.user_data)
    }

    /// Read access to a tracked flow.
    pub fn flow(&mut self, key: &FlowKey) -> Option<&Flow> {
        self.table.get_mut(key).map(|flow| &*flow)
    }
}
