//! Endpoint selection across a fixed pool.
//!
//! The choice itself is the pure function [`select`]; [`Balancer`] only keeps
//! the counters it reads (outstanding requests per endpoint and a rotating
//! cursor) and hands out [`Lease`]s that release their slot on drop.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use batchembed_core::config::BalancePolicy;
use batchembed_core::{Error, Result};

/// Index of the endpoint to use next.
///
/// Round robin ignores load and takes `cursor % n`. Least outstanding picks
/// the minimum, breaking ties by scanning from `cursor` so equal endpoints
/// still rotate.
pub fn select(policy: BalancePolicy, outstanding: &[usize], cursor: usize) -> usize {
    let n = outstanding.len();
    debug_assert!(n > 0);
    match policy {
        BalancePolicy::RoundRobin => cursor % n,
        BalancePolicy::LeastOutstanding => (0..n)
            .map(|step| (cursor + step) % n)
            .min_by_key(|&i| outstanding[i])
            .unwrap_or(0),
    }
}

struct Slot {
    url: String,
    outstanding: AtomicUsize,
    requests: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    pub url: String,
    pub outstanding: usize,
    pub requests: u64,
    pub failures: u64,
}

pub struct Balancer {
    slots: Vec<Slot>,
    policy: BalancePolicy,
    cursor: AtomicUsize,
}

impl Balancer {
    pub fn new(endpoints: &[String], policy: BalancePolicy) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoints configured".into()));
        }
        let slots = endpoints
            .iter()
            .map(|url| Slot {
                url: url.clone(),
                outstanding: AtomicUsize::new(0),
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
            .collect();
        Ok(Self { slots, policy, cursor: AtomicUsize::new(0) })
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reserve an endpoint for one request.
    pub fn acquire(&self) -> Lease<'_> {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let outstanding: Vec<usize> = self.slots.iter().map(|s| s.outstanding.load(Ordering::Relaxed)).collect();
        let index = select(self.policy, &outstanding, cursor);
        let slot = &self.slots[index];
        slot.outstanding.fetch_add(1, Ordering::Relaxed);
        slot.requests.fetch_add(1, Ordering::Relaxed);
        Lease { balancer: self, index }
    }

    pub fn snapshot(&self) -> Vec<EndpointStats> {
        self.slots
            .iter()
            .map(|s| EndpointStats {
                url: s.url.clone(),
                outstanding: s.outstanding.load(Ordering::Relaxed),
                requests: s.requests.load(Ordering::Relaxed),
                failures: s.failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

pub struct Lease<'a> {
    balancer: &'a Balancer,
    index: usize,
}

impl Lease<'_> {
    pub fn url(&self) -> &str {
        &self.balancer.slots[self.index].url
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn record_failure(&self) {
        self.balancer.slots[self.index].failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.balancer.slots[self.index].outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}
