//! Flow state management.
//!
//! Demultiplexes packets into bidirectional flows held in a hashed bucket
//! table. The table owns every flow and all of its reassembly and parser
//! state; flows leave through explicit deletion, the idle sweep, eviction
//! under memory pressure, or a full flush at shutdown.

pub mod flow;
pub mod flow_id;
pub(crate) mod hash;
pub mod pdu;

use std::mem;
use std::net::SocketAddr;

use crate::config::{FlowTableConfig, CACHE_LINE_SIZE};
use crate::flowtrack::flow::{Flow, FlowUserData};
use crate::flowtrack::flow_id::{Direction, FlowKey};
use crate::flowtrack::hash::HashFn;
use crate::EngineError;

/// Invoked when a flow is evicted, with the flow's user-data slot.
pub type FlowCleaner = Box<dyn FnMut(FlowUserData)>;

/// One hash slot. Aligned so flows sharing a slot stay on one cache line's
/// worth of bookkeeping.
#[repr(align(64))]
#[derive(Default)]
struct Bucket {
    flows: Vec<Flow>,
}

pub(crate) struct FlowTable {
    buckets: Vec<Bucket>,
    hash: HashFn,
    max_flows: usize,
    idle_timeout: u64,
    move_to_front: bool,
    max_trials: u16,
    len: usize,
    cleaner: Option<FlowCleaner>,
}

impl FlowTable {
    pub(crate) fn new(config: &FlowTableConfig, max_trials: u16) -> Self {
        debug_assert_eq!(mem::align_of::<Bucket>(), CACHE_LINE_SIZE);
        let nb_buckets = config
            .buckets
            .unwrap_or_else(|| prime_at_least(config.max_flows.max(16)));
        let mut buckets = Vec::with_capacity(nb_buckets);
        buckets.resize_with(nb_buckets, Bucket::default);
        FlowTable {
            buckets,
            hash: hash::select(config.hash),
            max_flows: config.max_flows,
            idle_timeout: config.idle_timeout,
            move_to_front: config.move_to_front,
            max_trials,
            len: 0,
            cleaner: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn set_cleaner(&mut self, cleaner: FlowCleaner) {
        self.cleaner = Some(cleaner);
    }

    pub(crate) fn set_max_trials(&mut self, max_trials: u16) {
        self.max_trials = max_trials;
    }

    pub(crate) fn set_max_flows(&mut self, max_flows: usize) {
        self.max_flows = max_flows;
    }

    pub(crate) fn set_idle_timeout(&mut self, idle_timeout: u64) {
        self.idle_timeout = idle_timeout;
    }

    /// Looks up the flow a packet belongs to, creating it on first sight.
    ///
    /// When the table is full, the least-recently-seen flow is evicted if
    /// it has exceeded the idle timeout; otherwise the packet is dropped
    /// with `ResourceExhausted`.
    pub(crate) fn get_or_create(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        proto: u8,
        now: u64,
    ) -> Result<(&mut Flow, Direction), EngineError> {
        let (key, dir) = FlowKey::from_endpoints(src, dst, proto);
        let b = (self.hash)(&key) as usize % self.buckets.len();

        if let Some(i) = self.buckets[b].flows.iter().position(|f| f.key == key) {
            let i = if self.move_to_front && i != 0 {
                let flow = self.buckets[b].flows.remove(i);
                self.buckets[b].flows.insert(0, flow);
                0
            } else {
                i
            };
            return Ok((&mut self.buckets[b].flows[i], dir));
        }

        if self.len >= self.max_flows && !self.evict_lru(now) {
            log::warn!("flow table full, dropping packet for {}", key);
            return Err(EngineError::ResourceExhausted);
        }

        let flow = Flow::new(key, now, self.max_trials);
        self.buckets[b].flows.insert(0, flow);
        self.len += 1;
        Ok((&mut self.buckets[b].flows[0], dir))
    }

    /// Mutable access to an existing flow.
    pub(crate) fn get_mut(&mut self, key: &FlowKey) -> Option<&mut Flow> {
        let b = (self.hash)(key) as usize % self.buckets.len();
        self.buckets[b].flows.iter_mut().find(|f| f.key == *key)
    }

    /// Removes one flow, handing its user data to the cleaner.
    pub(crate) fn delete(&mut self, key: &FlowKey) -> bool {
        let b = (self.hash)(key) as usize % self.buckets.len();
        match self.buckets[b].flows.iter().position(|f| f.key == *key) {
            Some(i) => {
                let flow = self.buckets[b].flows.remove(i);
                self.len -= 1;
                if let Some(cleaner) = self.cleaner.as_mut() {
                    cleaner(flow.user_data);
                }
                true
            }
            None => false,
        }
    }

    /// Evicts the least-recently-seen flow, provided it has idled past the
    /// timeout. Returns `false` if no flow qualifies.
    fn evict_lru(&mut self, now: u64) -> bool {
        let mut oldest: Option<(usize, usize, u64)> = None;
        for (bi, bucket) in self.buckets.iter().enumerate() {
            for (fi, flow) in bucket.flows.iter().enumerate() {
                if oldest.map_or(true, |(_, _, seen)| flow.last_seen < seen) {
                    oldest = Some((bi, fi, flow.last_seen));
                }
            }
        }
        match oldest {
            Some((bi, fi, seen)) if idle_expired(seen, self.idle_timeout, now) => {
                let flow = self.buckets[bi].flows.remove(fi);
                self.len -= 1;
                log::debug!("evicting idle flow {}", flow.key);
                if let Some(cleaner) = self.cleaner.as_mut() {
                    cleaner(flow.user_data);
                }
                true
            }
            _ => false,
        }
    }

    /// Removes every flow that has idled past the timeout. Returns the
    /// number of flows removed.
    pub(crate) fn sweep(&mut self, now: u64) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter_mut() {
            let mut i = 0;
            while i < bucket.flows.len() {
                if idle_expired(bucket.flows[i].last_seen, self.idle_timeout, now) {
                    let flow = bucket.flows.remove(i);
                    removed += 1;
                    if let Some(cleaner) = self.cleaner.as_mut() {
                        cleaner(flow.user_data);
                    }
                } else {
                    i += 1;
                }
            }
        }
        self.len -= removed;
        removed
    }

    /// Drains the whole table, invoking the cleaner for every flow.
    pub(crate) fn flush(&mut self) {
        log::info!("flushing flow table ({} flows)", self.len);
        for bucket in self.buckets.iter_mut() {
            for flow in bucket.flows.drain(..) {
                if let Some(cleaner) = self.cleaner.as_mut() {
                    cleaner(flow.user_data);
                }
            }
        }
        self.len = 0;
    }
}

#[inline]
fn idle_expired(last_seen: u64, idle_timeout: u64, now: u64) -> bool {
    match now.checked_sub(idle_timeout) {
        Some(cutoff) => last_seen < cutoff,
        None => false,
    }
}

/// Smallest prime not below `n`; bucket counts default to a prime near the
/// flow capacity.
fn prime_at_least(n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 4 {
            return n > 1;
        }
        if n % 2 == 0 {
            return false;
        }
        let mut d = 3;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 2;
        }
        true
    }
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn table(max_flows: usize, idle_timeout: u64) -> FlowTable {
        let config = FlowTableConfig {
            max_flows,
            buckets: None,
            idle_timeout,
            move_to_front: true,
            hash: Default::default(),
        };
        FlowTable::new(&config, 0)
    }

    #[test]
    fn prime_bucket_sizing() {
        assert_eq!(prime_at_least(16), 17);
        assert_eq!(prime_at_least(17), 17);
        assert_eq!(prime_at_least(100), 101);
    }

    #[test]
    fn both_directions_reach_one_flow() {
        let mut table = table(10, 60);
        let client = addr("10.0.0.1:40000");
        let server = addr("10.0.0.2:80");
        {
            let (flow, dir) = table.get_or_create(client, server, 6, 0).unwrap();
            flow.packets_seen += 1;
            assert_eq!(dir, Direction::AtoB);
        }
        let (flow, dir) = table.get_or_create(server, client, 6, 1).unwrap();
        assert_eq!(flow.packets_seen, 1);
        assert_eq!(dir, Direction::BtoA);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn eviction_under_pressure_prefers_lru() {
        let mut table = table(2, 10);
        let evicted: Rc<RefCell<Vec<Option<u32>>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&evicted);
        table.set_cleaner(Box::new(move |data| {
            log.borrow_mut()
                .push(data.and_then(|d| d.downcast::<u32>().ok()).map(|v| *v));
        }));

        let server = addr("10.0.0.2:80");
        {
            let (flow, _) = table
                .get_or_create(addr("10.0.0.1:40000"), server, 6, 0)
                .unwrap();
            flow.user_data = Some(Box::new(111u32));
        }
        table
            .get_or_create(addr("10.0.0.1:40001"), server, 6, 1)
            .unwrap();

        // Third flow arrives long after the first went idle.
        table
            .get_or_create(addr("10.0.0.1:40002"), server, 6, 100)
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(evicted.borrow().as_slice(), &[Some(111u32)]);
    }

    #[test]
    fn no_eviction_candidate_fails_insert() {
        let mut table = table(1, 1000);
        let server = addr("10.0.0.2:80");
        table
            .get_or_create(addr("10.0.0.1:40000"), server, 6, 0)
            .unwrap();
        let err = table
            .get_or_create(addr("10.0.0.1:40001"), server, 6, 1)
            .unwrap_err();
        assert_eq!(err, EngineError::ResourceExhausted);
    }

    #[test]
    fn sweep_removes_only_idle_flows() {
        let mut table = table(10, 30);
        let server = addr("10.0.0.2:80");
        table
            .get_or_create(addr("10.0.0.1:40000"), server, 6, 0)
            .unwrap();
        table
            .get_or_create(addr("10.0.0.1:40001"), server, 6, 50)
            .unwrap();
        assert_eq!(table.sweep(60), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_and_flush_report_to_cleaner() {
        let mut table = table(10, 30);
        let count = Rc::new(RefCell::new(0usize));
        let seen = Rc::clone(&count);
        table.set_cleaner(Box::new(move |_| *seen.borrow_mut() += 1));
        let server = addr("10.0.0.2:80");
        let key = {
            let (flow, _) = table
                .get_or_create(addr("10.0.0.1:40000"), server, 6, 0)
                .unwrap();
            *flow.key()
        };
        table
            .get_or_create(addr("10.0.0.1:40001"), server, 6, 0)
            .unwrap();
        assert!(table.delete(&key));
        assert!(!table.delete(&key));
        table.flush();
        assert_eq!(*count.borrow(), 2);
        assert_eq!(table.len(), 0);
    }
}
