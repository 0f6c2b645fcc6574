//! Engine configuration.
//!
//! All tunables live in [`EngineConfig`], loadable from a TOML file or
//! built from defaults. Every field has a default, so a configuration file
//! only needs the sections it changes:
//!
//! ```toml
//! link_type = "ethernet"
//! max_trials = 8
//! protocols = ["http"]
//!
//! [flow_table]
//!     max_flows = 100_000
//!     idle_timeout = 300
//!     hash = "murmur3"
//!
//! [ipv4_reassembly]
//!     per_host_memory_limit = 102_400
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use crate::flowtrack::hash::HashChoice;

/// Assumed cache line size for alignment-sensitive layouts.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default maximum number of tracked flows.
pub const DEFAULT_MAX_FLOWS: usize = 100_000;
/// Default seconds of inactivity before a flow may be expired.
pub const DEFAULT_FLOW_IDLE_TIMEOUT: u64 = 300;
/// Default bucket count of the per-host fragment tables.
pub const DEFAULT_FRAG_TABLE_SIZE: usize = 512;
/// Default per-host reassembly memory limit (100 KiB).
pub const DEFAULT_PER_HOST_MEMORY_LIMIT: usize = 100 * 1024;
/// Default total reassembly memory limit (10 MiB). With each host at its
/// own limit, up to a thousand hosts fit.
pub const DEFAULT_TOTAL_MEMORY_LIMIT: usize = 10 * 1024 * 1024;
/// Default IPv4 reassembly timeout in seconds.
pub const DEFAULT_IPV4_REASSEMBLY_TIMEOUT: u64 = 30;
/// Default IPv6 reassembly timeout in seconds.
pub const DEFAULT_IPV6_REASSEMBLY_TIMEOUT: u64 = 60;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> EngineConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    toml::from_str(&config_str).expect("Invalid config file")
}

/// Returns the default configuration: Ethernet link, every implemented
/// protocol inspected, reassembly enabled with the default caps.
pub fn default_config() -> EngineConfig {
    EngineConfig::default()
}

/// Link type of the capture source.
#[derive(Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Ethernet,
    /// Frames start directly at the IP header.
    RawIp,
}

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineConfig {
    /// Link type of the capture source.
    #[serde(default)]
    pub link_type: LinkType,

    /// Flow table settings.
    #[serde(default)]
    pub flow_table: FlowTableConfig,

    /// IPv4 defragmentation settings.
    #[serde(default = "default_ipv4_reassembly")]
    pub ipv4_reassembly: ReassemblyConfig,

    /// IPv6 defragmentation settings.
    #[serde(default = "default_ipv6_reassembly")]
    pub ipv6_reassembly: ReassemblyConfig,

    /// Reorder TCP segments before inspection. With this disabled,
    /// inspectors see raw segment payloads in arrival order and extracted
    /// fields may be wrong or incomplete.
    #[serde(default = "default_true")]
    pub tcp_reassembly: bool,

    /// Identification attempts per flow before giving up. `0` means
    /// unlimited.
    #[serde(default)]
    pub max_trials: u16,

    /// Protocols to inspect, by name (e.g. `["http"]`). An empty list
    /// enables every implemented protocol.
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            link_type: LinkType::default(),
            flow_table: FlowTableConfig::default(),
            ipv4_reassembly: default_ipv4_reassembly(),
            ipv6_reassembly: default_ipv6_reassembly(),
            tcp_reassembly: true,
            max_trials: 0,
            protocols: Vec::new(),
        }
    }
}

/// Flow table settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowTableConfig {
    /// Maximum number of tracked flows.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Bucket count; defaults to a prime near `max_flows`.
    #[serde(default)]
    pub buckets: Option<usize>,

    /// Seconds of inactivity before a flow may be expired.
    #[serde(default = "default_flow_idle_timeout")]
    pub idle_timeout: u64,

    /// Move a flow to the front of its bucket on lookup, accelerating
    /// repeated lookups of hot flows.
    #[serde(default = "default_true")]
    pub move_to_front: bool,

    /// Flow-key hash function.
    #[serde(default)]
    pub hash: HashChoice,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        FlowTableConfig {
            max_flows: DEFAULT_MAX_FLOWS,
            buckets: None,
            idle_timeout: DEFAULT_FLOW_IDLE_TIMEOUT,
            move_to_front: true,
            hash: HashChoice::default(),
        }
    }
}

/// Defragmentation settings for one IP version.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReassemblyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket count of the per-host table.
    #[serde(default = "default_frag_table_size")]
    pub table_size: usize,

    /// Bytes one host may park before it is dropped wholesale.
    #[serde(default = "default_per_host_memory_limit")]
    pub per_host_memory_limit: usize,

    /// Bytes the whole table may park before new fragments are dropped.
    #[serde(default = "default_total_memory_limit")]
    pub total_memory_limit: usize,

    /// Seconds before an incomplete datagram is dropped.
    #[serde(default = "default_ipv4_timeout")]
    pub timeout: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_flows() -> usize {
    DEFAULT_MAX_FLOWS
}

fn default_flow_idle_timeout() -> u64 {
    DEFAULT_FLOW_IDLE_TIMEOUT
}

fn default_frag_table_size() -> usize {
    DEFAULT_FRAG_TABLE_SIZE
}

fn default_per_host_memory_limit() -> usize {
    DEFAULT_PER_HOST_MEMORY_LIMIT
}

fn default_total_memory_limit() -> usize {
    DEFAULT_TOTAL_MEMORY_LIMIT
}

fn default_ipv4_timeout() -> u64 {
    DEFAULT_IPV4_REASSEMBLY_TIMEOUT
}

fn default_ipv4_reassembly() -> ReassemblyConfig {
    ReassemblyConfig {
        enabled: true,
        table_size: DEFAULT_FRAG_TABLE_SIZE,
        per_host_memory_limit: DEFAULT_PER_HOST_MEMORY_LIMIT,
        total_memory_limit: DEFAULT_TOTAL_MEMORY_LIMIT,
        timeout: DEFAULT_IPV4_REASSEMBLY_TIMEOUT,
    }
}

fn default_ipv6_reassembly() -> ReassemblyConfig {
    ReassemblyConfig {
        timeout: DEFAULT_IPV6_REASSEMBLY_TIMEOUT,
        ..default_ipv4_reassembly()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.flow_table.max_flows, DEFAULT_MAX_FLOWS);
        assert_eq!(config.ipv4_reassembly.timeout, DEFAULT_IPV4_REASSEMBLY_TIMEOUT);
        assert_eq!(config.ipv6_reassembly.timeout, DEFAULT_IPV6_REASSEMBLY_TIMEOUT);
        assert!(config.tcp_reassembly);
        assert_eq!(config.max_trials, 0);
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let config: EngineConfig = toml::from_str(
            r#"
            link_type = "raw_ip"
            max_trials = 8

            [flow_table]
            max_flows = 1024
            hash = "murmur3"

            [ipv6_reassembly]
            timeout = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.link_type, LinkType::RawIp);
        assert_eq!(config.max_trials, 8);
        assert_eq!(config.flow_table.max_flows, 1024);
        assert_eq!(config.flow_table.hash, HashChoice::Murmur3);
        assert_eq!(config.ipv6_reassembly.timeout, 120);
        // Untouched sections keep their defaults.
        assert_eq!(config.ipv4_reassembly.timeout, DEFAULT_IPV4_REASSEMBLY_TIMEOUT);
        assert!(config.flow_table.move_to_front);
    }
}
