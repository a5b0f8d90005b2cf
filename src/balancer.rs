//! Upstream selection strategies.
//!
//! A [`LoadBalancer`] wraps the [`UpstreamPool`] with one of four
//! strategies sharing a single operation: given the pool, return one
//! eligible upstream or report that none is available. Eligibility is the
//! circuit gate ([`UpstreamState::check_circuit_state`]); the balancer
//! never writes health or circuit state, it only reads it.
//!
//! Selection is safe to call concurrently from request handlers. The
//! round-robin counter is a lock-free atomic; the consistent-hash ring is
//! rebuilt under a short mutex whenever the eligible set changes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::upstream::{UpstreamPool, UpstreamState};
use crate::{ProxyError, Result};

/// Virtual ring entries created per eligible upstream.
pub const DEFAULT_VIRTUAL_NODES: usize = 50;

/// Hash key used when the caller does not thread a request key through
/// the selector.
const DEFAULT_HASH_KEY: &str = "default";

/// The selection strategies understood by the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    Latency,
    ConsistentHash,
}

impl StrategyKind {
    /// Parses an operator-facing strategy name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(Self::RoundRobin),
            "least_connections" => Some(Self::LeastConnections),
            "latency" => Some(Self::Latency),
            "consistent_hash" => Some(Self::ConsistentHash),
            _ => None,
        }
    }

    /// Returns the operator-facing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Latency => "latency",
            Self::ConsistentHash => "consistent_hash",
        }
    }
}

/// A load balancer over an [`UpstreamPool`]. Cloning is cheap; all clones
/// share the same strategy state.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pool: UpstreamPool,
    strategy: Arc<Strategy>,
}

#[derive(Debug)]
enum Strategy {
    /// Monotonic counter; selection walks from `counter++ % n` to the
    /// first eligible upstream.
    RoundRobin { counter: AtomicU64 },
    LeastConnections,
    Latency,
    ConsistentHash { ring: Mutex<HashRing> },
}

impl LoadBalancer {
    /// Creates a balancer with the given strategy over the pool.
    pub fn new(pool: UpstreamPool, kind: StrategyKind) -> Self {
        Self::with_virtual_nodes(pool, kind, DEFAULT_VIRTUAL_NODES)
    }

    /// Like [`LoadBalancer::new`], but with an explicit virtual-node count
    /// for the consistent-hash ring.
    pub fn with_virtual_nodes(pool: UpstreamPool, kind: StrategyKind, virtual_nodes: usize) -> Self {
        let strategy = match kind {
            StrategyKind::RoundRobin => Strategy::RoundRobin {
                counter: AtomicU64::new(0),
            },
            StrategyKind::LeastConnections => Strategy::LeastConnections,
            StrategyKind::Latency => Strategy::Latency,
            StrategyKind::ConsistentHash => Strategy::ConsistentHash {
                ring: Mutex::new(HashRing::new(virtual_nodes.max(1))),
            },
        };
        Self {
            pool,
            strategy: Arc::new(strategy),
        }
    }

    /// Returns a reference to the underlying upstream pool.
    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    /// Selects one eligible upstream for the next request.
    ///
    /// `key` is only consulted by the consistent-hash strategy; callers
    /// that pass `None` get the fixed default key, which pins every
    /// request to one upstream until it becomes ineligible. Deriving a
    /// real key (client IP, session cookie) is the caller's concern.
    pub fn next(&self, key: Option<&str>) -> Result<UpstreamState> {
        let backends = self.pool.all();
        if backends.is_empty() {
            return Err(ProxyError::NoBackendAvailable);
        }

        match &*self.strategy {
            Strategy::RoundRobin { counter } => {
                let n = backends.len() as u64;
                (0..backends.len())
                    .map(|_| {
                        let idx = counter.fetch_add(1, Ordering::Relaxed) % n;
                        &backends[idx as usize]
                    })
                    .find(|b| b.check_circuit_state())
                    .cloned()
                    .ok_or(ProxyError::NoBackendAvailable)
            }
            Strategy::LeastConnections => backends
                .iter()
                .filter(|b| b.check_circuit_state())
                .min_by_key(|b| b.active_connections())
                .cloned()
                .ok_or(ProxyError::NoBackendAvailable),
            Strategy::Latency => backends
                .iter()
                .filter(|b| b.check_circuit_state())
                .min_by_key(|b| b.avg_latency())
                .cloned()
                .ok_or(ProxyError::NoBackendAvailable),
            Strategy::ConsistentHash { ring } => {
                let mut ring = ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if !ring.is_valid(backends) {
                    ring.rebuild(backends);
                }
                let idx = ring
                    .lookup(key.unwrap_or(DEFAULT_HASH_KEY))
                    .ok_or(ProxyError::NoBackendAvailable)?;
                backends
                    .get(idx)
                    .cloned()
                    .ok_or(ProxyError::NoBackendAvailable)
            }
        }
    }
}

/// One virtual node on the consistent-hash ring.
#[derive(Debug, Clone, Copy)]
struct RingEntry {
    hash: u64,
    /// Index into the pool slice.
    index: usize,
}

/// A sorted ring of virtual nodes over the eligible upstreams.
///
/// Ring keys are `{upstream_uri}#{v}` for `v` in `[0, virtual_nodes)`,
/// hashed with SHA-256 truncated to the top 8 bytes big-endian. The ring
/// is valid while its length equals `eligible_count * virtual_nodes`; an
/// eligibility change invalidates it and forces a rebuild on the next
/// lookup.
#[derive(Debug)]
struct HashRing {
    entries: Vec<RingEntry>,
    virtual_nodes: usize,
}

impl HashRing {
    fn new(virtual_nodes: usize) -> Self {
        Self {
            entries: Vec::new(),
            virtual_nodes,
        }
    }

    fn is_valid(&self, backends: &[UpstreamState]) -> bool {
        let expected = backends
            .iter()
            .filter(|b| b.check_circuit_state())
            .count()
            * self.virtual_nodes;
        !self.entries.is_empty() && self.entries.len() == expected
    }

    fn rebuild(&mut self, backends: &[UpstreamState]) {
        let mut entries = Vec::new();
        for (index, backend) in backends.iter().enumerate() {
            if !backend.check_circuit_state() {
                continue;
            }
            for v in 0..self.virtual_nodes {
                let key = format!("{}#{v}", backend.uri());
                entries.push(RingEntry {
                    hash: hash_key(&key),
                    index,
                });
            }
        }
        entries.sort_unstable_by_key(|e| e.hash);
        self.entries = entries;
    }

    /// Finds the first ring entry at or after the key hash, wrapping to
    /// the start of the ring. Returns the pool index of its upstream.
    fn lookup(&self, key: &str) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let h = hash_key(key);
        let idx = self.entries.partition_point(|e| e.hash < h);
        let entry = if idx == self.entries.len() {
            self.entries[0]
        } else {
            self.entries[idx]
        };
        Some(entry.index)
    }
}

/// SHA-256 of the key, truncated to the top 8 bytes big-endian.
fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}
