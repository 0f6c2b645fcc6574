//! IPv4/IPv6 datagram defragmentation.
//!
//! Fragments are grouped per source host, then per datagram identification.
//! Each host is charged for the bytes it has parked; a host that exceeds its
//! memory limit is dropped wholesale, and a global limit bounds the table as
//! a whole. Incomplete datagrams expire against the packet clock.

use std::net::IpAddr;

use crate::config::ReassemblyConfig;
use crate::protocols::packet::{FragMeta, IpCtx};
use crate::reassembly::timers::TimerQueue;
use crate::reassembly::FragmentList;
use crate::EngineError;

/// One partially reassembled datagram.
#[derive(Debug)]
struct Datagram {
    id: u32,
    /// Network-layer context of the first fragment seen, used to resume
    /// transport decoding once the datagram completes.
    ctx: IpCtx,
    frags: FragmentList,
    /// Known once the fragment without a more-fragments flag arrives.
    total_len: Option<u32>,
    expires_at: u64,
}

/// All datagrams in flight from one source host.
#[derive(Debug)]
struct HostEntry {
    addr: IpAddr,
    mem_used: usize,
    datagrams: Vec<Datagram>,
}

/// Defragmentation table for one IP version.
#[derive(Debug)]
pub(crate) struct IpDefrag {
    per_host_limit: usize,
    total_limit: usize,
    timeout: u64,
    buckets: Vec<Vec<HostEntry>>,
    timers: TimerQueue<(IpAddr, u32)>,
    total_mem: usize,
}

impl IpDefrag {
    pub(crate) fn new(config: &ReassemblyConfig) -> Self {
        let mut buckets = Vec::with_capacity(config.table_size);
        buckets.resize_with(config.table_size, Vec::new);
        IpDefrag {
            per_host_limit: config.per_host_memory_limit,
            total_limit: config.total_memory_limit,
            timeout: config.timeout,
            buckets,
            timers: TimerQueue::new(),
            total_mem: 0,
        }
    }

    pub(crate) fn set_memory_limits(&mut self, per_host: usize, total: usize) {
        self.per_host_limit = per_host;
        self.total_limit = total;
    }

    /// Changes the reassembly timeout. Every in-flight datagram's deadline
    /// is shifted to the new timeout and the timer list is rebuilt in
    /// deadline order, preserving its head-first expiry invariant.
    pub(crate) fn set_timeout(&mut self, timeout: u64) {
        let old = self.timeout;
        self.timeout = timeout;
        if timeout == old {
            return;
        }
        let mut rearmed: Vec<(u64, (IpAddr, u32))> = Vec::new();
        for bucket in self.buckets.iter_mut() {
            for host in bucket.iter_mut() {
                for datagram in host.datagrams.iter_mut() {
                    datagram.expires_at = datagram
                        .expires_at
                        .saturating_sub(old)
                        .saturating_add(timeout);
                    rearmed.push((datagram.expires_at, (host.addr, datagram.id)));
                }
            }
        }
        rearmed.sort_by_key(|(deadline, _)| *deadline);
        self.timers = TimerQueue::new();
        for (deadline, key) in rearmed {
            self.timers.arm(deadline, key);
        }
    }

    /// Bytes currently parked across all hosts.
    pub(crate) fn total_memory(&self) -> usize {
        self.total_mem
    }

    fn host_bucket(&self, addr: &IpAddr) -> usize {
        let mut h = 0x811c_9dc5u32;
        let fold = |mut h: u32, bytes: &[u8]| {
            for &b in bytes {
                h = (h ^ b as u32).wrapping_mul(0x0100_0193);
            }
            h
        };
        h = match addr {
            IpAddr::V4(a) => fold(h, &a.octets()),
            IpAddr::V6(a) => fold(h, &a.octets()),
        };
        h as usize % self.buckets.len()
    }

    /// Drops datagrams whose reassembly deadline has passed. Driven lazily
    /// from the packet clock; expired datagrams yield nothing.
    pub(crate) fn expire(&mut self, now: u64) {
        while let Some((deadline, (addr, id))) = self.timers.pop_expired(now) {
            self.remove_datagram(&addr, id, Some(deadline));
        }
    }

    /// Removes one datagram and its memory charge. When `deadline` is
    /// given, only a datagram still carrying that exact deadline is
    /// removed; a re-armed datagram makes the popped timer stale.
    fn remove_datagram(&mut self, addr: &IpAddr, id: u32, deadline: Option<u64>) {
        let b = self.host_bucket(addr);
        let bucket = &mut self.buckets[b];
        let hi = match bucket.iter().position(|h| h.addr == *addr) {
            Some(i) => i,
            None => return,
        };
        let di = match bucket[hi].datagrams.iter().position(|d| d.id == id) {
            Some(i) => i,
            None => return,
        };
        if let Some(deadline) = deadline {
            if bucket[hi].datagrams[di].expires_at != deadline {
                return;
            }
            log::debug!("reassembly timeout for datagram {} from {}", id, addr);
        }
        let released = bucket[hi].datagrams[di].frags.stored_bytes() as usize;
        bucket[hi].datagrams.remove(di);
        bucket[hi].mem_used -= released;
        if bucket[hi].datagrams.is_empty() {
            bucket.remove(hi);
        }
        self.total_mem -= released;
    }

    /// Feeds one fragment. Returns the reassembled transport payload once
    /// the datagram is covered end to end.
    pub(crate) fn process(
        &mut self,
        ctx: IpCtx,
        frag: FragMeta,
        data: &[u8],
        now: u64,
    ) -> Result<Option<(IpCtx, Vec<u8>)>, EngineError> {
        self.expire(now);
        if data.is_empty() {
            return Ok(None);
        }
        if self.total_mem + data.len() > self.total_limit {
            log::warn!("fragment dropped: total reassembly memory limit reached");
            return Err(EngineError::ResourceExhausted);
        }

        let b = self.host_bucket(&ctx.src);
        let bucket = &mut self.buckets[b];
        let hi = match bucket.iter().position(|h| h.addr == ctx.src) {
            Some(i) => i,
            None => {
                bucket.push(HostEntry {
                    addr: ctx.src,
                    mem_used: 0,
                    datagrams: Vec::new(),
                });
                bucket.len() - 1
            }
        };
        let di = match bucket[hi].datagrams.iter().position(|d| d.id == frag.id) {
            Some(i) => i,
            None => {
                bucket[hi].datagrams.push(Datagram {
                    id: frag.id,
                    ctx,
                    frags: FragmentList::new(),
                    total_len: None,
                    expires_at: 0,
                });
                bucket[hi].datagrams.len() - 1
            }
        };

        let out = bucket[hi].datagrams[di].frags.insert(frag.offset, data, false);
        let delta = out.inserted as i64 - out.removed as i64;
        bucket[hi].mem_used = (bucket[hi].mem_used as i64 + delta) as usize;
        self.total_mem = (self.total_mem as i64 + delta) as usize;

        if bucket[hi].mem_used > self.per_host_limit {
            log::warn!("host {} over reassembly memory limit, dropping", ctx.src);
            let released = bucket[hi].mem_used;
            bucket.remove(hi);
            self.total_mem -= released;
            return Err(EngineError::ResourceExhausted);
        }

        if !frag.more {
            bucket[hi].datagrams[di].total_len = Some(frag.offset.wrapping_add(data.len() as u32));
        }

        let complete = match bucket[hi].datagrams[di].total_len {
            Some(total) => bucket[hi].datagrams[di].frags.is_complete(0, total),
            None => false,
        };
        if complete {
            let dg = &bucket[hi].datagrams[di];
            let total = dg.total_len.unwrap_or(0) as usize;
            let mut payload = vec![0u8; total];
            let compacted = dg.frags.compact_into(&mut payload);
            let dg_ctx = dg.ctx;
            self.remove_datagram(&ctx.src, frag.id, None);
            return match compacted {
                Ok(()) => Ok(Some((dg_ctx, payload))),
                Err(e) => Err(e),
            };
        }

        let expires = now + self.timeout;
        bucket[hi].datagrams[di].expires_at = expires;
        self.timers.arm(expires, (ctx.src, frag.id));
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const UDP: u8 = 17;

    fn ctx() -> IpCtx {
        IpCtx {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            proto: UDP,
        }
    }

    fn config() -> ReassemblyConfig {
        ReassemblyConfig {
            enabled: true,
            table_size: 512,
            per_host_memory_limit: 100 * 1024,
            total_memory_limit: 10 * 1024 * 1024,
            timeout: 30,
        }
    }

    fn frag(id: u32, offset: u32, more: bool) -> FragMeta {
        FragMeta { id, offset, more }
    }

    #[test]
    fn out_of_order_with_duplicate() {
        let mut defrag = IpDefrag::new(&config());
        let datagram: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();

        assert_eq!(
            defrag
                .process(ctx(), frag(7, 1000, false), &datagram[1000..], 0)
                .unwrap(),
            None
        );
        assert_eq!(
            defrag
                .process(ctx(), frag(7, 500, true), &datagram[500..1000], 1)
                .unwrap(),
            None
        );
        // Duplicate of the middle fragment.
        assert_eq!(
            defrag
                .process(ctx(), frag(7, 500, true), &datagram[500..1000], 1)
                .unwrap(),
            None
        );
        let (rctx, payload) = defrag
            .process(ctx(), frag(7, 0, true), &datagram[..500], 2)
            .unwrap()
            .expect("datagram should complete");
        assert_eq!(payload, datagram);
        assert_eq!(rctx.proto, UDP);
        // Entry torn down, accounting back to zero.
        assert_eq!(defrag.total_memory(), 0);
    }

    #[test]
    fn timeout_releases_memory() {
        let mut defrag = IpDefrag::new(&config());
        defrag
            .process(ctx(), frag(9, 0, true), &[0u8; 400], 0)
            .unwrap();
        assert_eq!(defrag.total_memory(), 400);

        // Within the window nothing expires.
        defrag.expire(29);
        assert_eq!(defrag.total_memory(), 400);

        defrag.expire(31);
        assert_eq!(defrag.total_memory(), 0);

        // A late sibling fragment starts a fresh datagram.
        assert_eq!(
            defrag
                .process(ctx(), frag(9, 400, false), &[0u8; 100], 31)
                .unwrap(),
            None
        );
    }

    #[test]
    fn rearm_keeps_entry_alive() {
        let mut defrag = IpDefrag::new(&config());
        defrag
            .process(ctx(), frag(3, 0, true), &[0u8; 100], 0)
            .unwrap();
        defrag
            .process(ctx(), frag(3, 100, true), &[1u8; 100], 20)
            .unwrap();
        // The deadline armed at t=0 is stale; the entry now expires at 50.
        defrag.expire(35);
        assert_eq!(defrag.total_memory(), 200);
        defrag.expire(51);
        assert_eq!(defrag.total_memory(), 0);
    }

    #[test]
    fn timeout_change_rearms_in_flight_entries() {
        let mut defrag = IpDefrag::new(&config());
        defrag
            .process(ctx(), frag(1, 0, true), &[0u8; 400], 0)
            .unwrap();
        // Armed at t=0 with the 30 s default; shrinking the timeout moves
        // the deadline to t=5.
        defrag.set_timeout(5);
        defrag.expire(4);
        assert_eq!(defrag.total_memory(), 400);
        defrag.expire(6);
        assert_eq!(defrag.total_memory(), 0);

        // Growing the timeout extends an in-flight deadline.
        defrag.set_timeout(30);
        defrag
            .process(ctx(), frag(2, 0, true), &[0u8; 100], 10)
            .unwrap();
        defrag.set_timeout(60);
        defrag.expire(41);
        assert_eq!(defrag.total_memory(), 100);
        defrag.expire(71);
        assert_eq!(defrag.total_memory(), 0);
    }

    #[test]
    fn shrinking_timeout_keeps_expiry_order() {
        let mut defrag = IpDefrag::new(&config());
        defrag
            .process(ctx(), frag(1, 0, true), &[0u8; 400], 0)
            .unwrap();
        defrag.set_timeout(5);
        // A fresh entry armed after the change sits behind the re-armed
        // one with a later deadline, keeping the expiry list monotone.
        defrag
            .process(ctx(), frag(2, 0, true), &[0u8; 100], 2)
            .unwrap();
        defrag.expire(6);
        assert_eq!(defrag.total_memory(), 100);
        defrag.expire(8);
        assert_eq!(defrag.total_memory(), 0);
    }

    #[test]
    fn per_host_limit_drops_host() {
        let mut cfg = config();
        cfg.per_host_memory_limit = 1000;
        let mut defrag = IpDefrag::new(&cfg);
        defrag
            .process(ctx(), frag(1, 0, true), &[0u8; 800], 0)
            .unwrap();
        let err = defrag
            .process(ctx(), frag(2, 0, true), &[0u8; 800], 0)
            .unwrap_err();
        assert_eq!(err, EngineError::ResourceExhausted);
        assert_eq!(defrag.total_memory(), 0);
    }

    #[test]
    fn total_limit_rejects_new_work() {
        let mut cfg = config();
        cfg.total_memory_limit = 1000;
        cfg.per_host_memory_limit = 1000;
        let mut defrag = IpDefrag::new(&cfg);
        defrag
            .process(ctx(), frag(1, 0, true), &[0u8; 900], 0)
            .unwrap();
        let other = IpCtx {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            ..ctx()
        };
        let err = defrag
            .process(other, frag(1, 0, true), &[0u8; 200], 1)
            .unwrap_err();
        assert_eq!(err, EngineError::ResourceExhausted);
        // The original host expires and frees the budget.
        defrag.expire(40);
        assert_eq!(
            defrag
                .process(other, frag(1, 0, true), &[0u8; 200], 41)
                .unwrap(),
            None
        );
    }
}
