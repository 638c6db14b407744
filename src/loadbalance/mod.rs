//! Load balancer selection: picks one destination client config from an
//! upstream's (non-empty) list.
//!
//! Grounded on `harborgrid-justin-rusty-db/src/networking/loadbalancer/strategies/*.rs`:
//! each strategy is a small stateless-with-respect-to-the-list struct behind
//! a shared trait, selected by a process-wide registry keyed by type name
//! (mirrors `agent.upstream.<id>.loadBalance` in `original_source/config/config.go`).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::DstClientConf;
use crate::error::{ProxyError, Result};

/// The closed-but-extensible set of load balance types `spec.md` §4.2 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadBalanceType {
    Default,
    Random,
    Weighted,
    ConsistentHash,
}

impl LoadBalanceType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(Self::Default),
            "random" => Ok(Self::Random),
            "weighted" => Ok(Self::Weighted),
            "hash" | "consistent_hash" | "consistentHash" => Ok(Self::ConsistentHash),
            other => Err(ProxyError::Config(format!("unknown loadBalance type: {other}"))),
        }
    }
}

impl Default for LoadBalanceType {
    fn default() -> Self {
        Self::Default
    }
}

/// A selector is pure with respect to the destination list and whatever
/// upstream-local counter/RNG it reads, and must never block (spec.md §4.2).
pub trait LoadBalancer: Send + Sync {
    fn select<'a>(&self, dsts: &'a [DstClientConf], affinity_key: &str) -> Result<&'a DstClientConf>;

    fn lb_type(&self) -> LoadBalanceType;
}

/// Monotonic round-robin. The counter is upstream-local and incremented
/// atomically, so concurrent selections still produce a fair rotation
/// (spec.md P6).
#[derive(Default)]
pub struct RoundRobinBalancer {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select<'a>(&self, dsts: &'a [DstClientConf], _affinity_key: &str) -> Result<&'a DstClientConf> {
        if dsts.is_empty() {
            return Err(ProxyError::Config("upstream has no destinations".into()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % dsts.len();
        Ok(&dsts[idx])
    }

    fn lb_type(&self) -> LoadBalanceType {
        LoadBalanceType::Default
    }
}

/// Uniform-random selection over the destination list.
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select<'a>(&self, dsts: &'a [DstClientConf], _affinity_key: &str) -> Result<&'a DstClientConf> {
        if dsts.is_empty() {
            return Err(ProxyError::Config("upstream has no destinations".into()));
        }
        let idx = rand::random::<usize>() % dsts.len();
        Ok(&dsts[idx])
    }

    fn lb_type(&self) -> LoadBalanceType {
        LoadBalanceType::Random
    }
}

/// Weighted round-robin, grounded on
/// `networking/loadbalancer/strategies/round_robin.rs::WeightedRoundRobinBalancer`.
/// Destinations with no explicit weight default to weight 1.
#[derive(Default)]
pub struct WeightedBalancer {
    next: AtomicUsize,
}

impl LoadBalancer for WeightedBalancer {
    fn select<'a>(&self, dsts: &'a [DstClientConf], _affinity_key: &str) -> Result<&'a DstClientConf> {
        if dsts.is_empty() {
            return Err(ProxyError::Config("upstream has no destinations".into()));
        }
        let total_weight: u32 = dsts.iter().map(|d| d.weight.max(1)).sum();
        let position = self.next.fetch_add(1, Ordering::Relaxed) % total_weight as usize;

        let mut cumulative = 0u32;
        for dst in dsts {
            cumulative += dst.weight.max(1);
            if position < cumulative as usize {
                return Ok(dst);
            }
        }
        Ok(&dsts[0])
    }

    fn lb_type(&self) -> LoadBalanceType {
        LoadBalanceType::Weighted
    }
}

/// Consistent hash on the agent channel id, grounded on the FNV-1a hash used
/// in `networking/loadbalancer/strategies/consistent_hash.rs`. Simple
/// modulo-hash rather than a full virtual-node ring: spec.md only requires
/// "consistent-hash on agent channel id", not ring rebalancing semantics.
pub struct ConsistentHashBalancer;

impl ConsistentHashBalancer {
    fn fnv1a(data: &[u8]) -> u64 {
        const FNV_OFFSET: u64 = 14695981039346656037;
        const FNV_PRIME: u64 = 1099511628211;
        let mut hash = FNV_OFFSET;
        for &byte in data {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn select<'a>(&self, dsts: &'a [DstClientConf], affinity_key: &str) -> Result<&'a DstClientConf> {
        if dsts.is_empty() {
            return Err(ProxyError::Config("upstream has no destinations".into()));
        }
        let idx = (Self::fnv1a(affinity_key.as_bytes()) as usize) % dsts.len();
        Ok(&dsts[idx])
    }

    fn lb_type(&self) -> LoadBalanceType {
        LoadBalanceType::ConsistentHash
    }
}

/// Build the selector for a given type. Kept as a plain `match` rather than
/// a runtime-populated map (spec.md §9: "keep them as immutable
/// initialization-time tables") since the set of types is closed at compile
/// time.
pub fn build(lb_type: LoadBalanceType) -> Box<dyn LoadBalancer> {
    match lb_type {
        LoadBalanceType::Default => Box::new(RoundRobinBalancer::default()),
        LoadBalanceType::Random => Box::new(RandomBalancer),
        LoadBalanceType::Weighted => Box::new(WeightedBalancer::default()),
        LoadBalanceType::ConsistentHash => Box::new(ConsistentHashBalancer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DstClientConf, Protocol};

    fn dsts(n: usize) -> Vec<DstClientConf> {
        (0..n)
            .map(|i| DstClientConf {
                ip: format!("10.0.0.{i}"),
                port: 19980,
                protocol: Protocol::Tcp,
                scheme: None,
                path: None,
                subprotocol: None,
                weight: 1,
            })
            .collect()
    }

    // P6: round-robin fairness.
    #[test]
    fn round_robin_is_fair_over_many_selections() {
        let lb = RoundRobinBalancer::default();
        let dsts = dsts(3);
        let mut counts = [0u32; 3];
        for _ in 0..9 {
            let picked = lb.select(&dsts, "").unwrap();
            let idx = dsts.iter().position(|d| d.ip == picked.ip).unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn round_robin_visits_in_order() {
        let lb = RoundRobinBalancer::default();
        let dsts = dsts(3);
        let order: Vec<String> = (0..6).map(|_| lb.select(&dsts, "").unwrap().ip.clone()).collect();
        assert_eq!(
            order,
            vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.0", "10.0.0.1", "10.0.0.2"]
        );
    }

    #[test]
    fn empty_list_is_config_error() {
        let lb = RoundRobinBalancer::default();
        assert!(lb.select(&[], "").is_err());
    }

    #[test]
    fn consistent_hash_is_deterministic() {
        let lb = ConsistentHashBalancer;
        let dsts = dsts(5);
        let first = lb.select(&dsts, "agent-42").unwrap().ip.clone();
        let second = lb.select(&dsts, "agent-42").unwrap().ip.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert!(LoadBalanceType::parse("bogus").is_err());
        assert_eq!(LoadBalanceType::parse("").unwrap(), LoadBalanceType::Default);
        assert_eq!(LoadBalanceType::parse("random").unwrap(), LoadBalanceType::Random);
    }
}
