//! Per-flow state.

use std::any::Any;

use crate::flowtrack::flow_id::FlowKey;
use crate::protocols::stream::http::HttpDirState;
use crate::protocols::stream::Protocol;
use crate::reassembly::tcp::TcpDirState;

/// Opaque per-flow user data. Callbacks may populate it; the flow cleaner
/// receives it when the flow is evicted.
pub type FlowUserData = Option<Box<dyn Any>>;

/// Identification progress for a flow.
#[derive(Debug)]
pub(crate) enum Identification {
    /// Still probing. `trials_left` counts the remaining rounds in which
    /// every inspector may reject before the flow is abandoned; `None`
    /// means unlimited.
    Pending { trials_left: Option<u16> },
    /// Identified; the protocol is cached for the rest of the flow's life.
    Known(Protocol),
    /// Identification abandoned after the trial budget ran out.
    GiveUp,
}

/// Reassembly and parser state for one direction of a flow.
#[derive(Debug, Default)]
pub(crate) struct DirState {
    pub(crate) tcp: TcpDirState,
    pub(crate) http: HttpDirState,
}

/// A tracked bidirectional conversation.
pub struct Flow {
    pub(crate) key: FlowKey,
    pub(crate) first_seen: u64,
    pub(crate) last_seen: u64,
    pub(crate) packets_seen: u64,
    /// Set once a SYN is observed. Flows joined mid-stream get a more
    /// lenient identification policy.
    pub(crate) seen_syn: bool,
    pub(crate) ident: Identification,
    pub(crate) dirs: [DirState; 2],
    pub(crate) user_data: FlowUserData,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("first_seen", &self.first_seen)
            .field("last_seen", &self.last_seen)
            .field("packets_seen", &self.packets_seen)
            .field("seen_syn", &self.seen_syn)
            .field("ident", &self.ident)
            .field("dirs", &self.dirs)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

impl Flow {
    pub(crate) fn new(key: FlowKey, now: u64, max_trials: u16) -> Self {
        Flow {
            key,
            first_seen: now,
            last_seen: now,
            packets_seen: 0,
            seen_syn: false,
            ident: Identification::Pending {
                trials_left: if max_trials == 0 {
                    None
                } else {
                    Some(max_trials)
                },
            },
            dirs: Default::default(),
            user_data: None,
        }
    }

    /// The flow's canonical key.
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// The cached identification, or `Unknown` while probing or after
    /// giving up.
    pub fn protocol(&self) -> Protocol {
        match self.ident {
            Identification::Known(proto) => proto,
            _ => Protocol::Unknown,
        }
    }

    /// Timestamp of the first packet of the flow.
    pub fn first_seen(&self) -> u64 {
        self.first_seen
    }

    /// Timestamp of the most recent packet of the flow.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Number of packets observed on the flow.
    pub fn packets_seen(&self) -> u64 {
        self.packets_seen
    }

    /// `true` if the flow's TCP handshake was observed.
    pub fn seen_syn(&self) -> bool {
        self.seen_syn
    }
}
