//! Weighted rendezvous (highest-random-weight) hashing.
//!
//! Each member scores every lookup key independently; the winner is the
//! highest score. Adding or removing a member only moves the keys that member
//! wins, so placement is stable under churn.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct RendezvousRing {
    members: BTreeMap<String, f64>,
}

impl RendezvousRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring where every key carries weight 1.0.
    pub fn with_members<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new();
        for key in keys {
            ring.add(key, 1.0);
        }
        ring
    }

    /// Insert or reweight a member. Non-positive or non-finite weights are
    /// ignored since such a member could never win a key.
    pub fn add(&mut self, key: impl Into<String>, weight: f64) {
        if weight.is_finite() && weight > 0.0 {
            self.members.insert(key.into(), weight);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.members.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.members
            .iter()
            .map(|(member, weight)| (score(member, *weight, key), member))
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, member)| member.clone())
    }

    /// The `n` highest-scoring members, best first. Returns fewer than `n`
    /// when the ring is smaller.
    pub fn lookup_top_n(&self, key: &str, n: usize) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = self
            .members
            .iter()
            .map(|(member, weight)| (score(member, *weight, key), member))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(n)
            .map(|(_, member)| member.clone())
            .collect()
    }
}

/// `-weight / ln(h)` with `h` uniform in (0, 1): the logarithmic method for
/// weighted rendezvous hashing.
fn score(member: &str, weight: f64, key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(member.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(bytes) >> 11;
    // (bits + 0.5) / 2^53 stays strictly inside (0, 1)
    let h = (bits as f64 + 0.5) / (1u64 << 53) as f64;
    -weight / h.ln()
}
