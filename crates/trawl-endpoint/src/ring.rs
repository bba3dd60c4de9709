use std::cmp::Reverse;
use std::fmt;

use trawl_core::Error;

/// The address of one backend replica, e.g. `http://searcher-0.searcher:3181`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone)]
struct Node {
    endpoint: Endpoint,
    // Pre-seeded with the endpoint so scoring a key only hashes the key bytes.
    seed: blake3::Hasher,
}

impl Node {
    fn new(endpoint: Endpoint) -> Self {
        let mut seed = blake3::Hasher::new();
        seed.update(&(endpoint.0.len() as u64).to_le_bytes());
        seed.update(endpoint.0.as_bytes());
        Self { endpoint, seed }
    }

    fn score(&self, key: &str) -> u64 {
        let mut hasher = self.seed.clone();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// Rendezvous (highest random weight) hashing over an immutable endpoint set.
///
/// A key is owned by the endpoint with the highest `score(endpoint, key)`; equal scores are broken
/// by comparing endpoint strings, so the order is total. Rings are never mutated: a topology change
/// builds a new ring.
#[derive(Clone, Default)]
pub struct HashRing {
    nodes: Vec<Node>,
}

impl HashRing {
    /// Builds a ring over the distinct endpoints in `endpoints`.
    pub fn new<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let mut endpoints: Vec<Endpoint> = endpoints.into_iter().map(Into::into).collect();
        endpoints.sort_unstable();
        endpoints.dedup();
        Self {
            nodes: endpoints.into_iter().map(Node::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.nodes.iter().map(|node| node.endpoint.clone()).collect()
    }

    pub fn get(&self, key: &str) -> Result<Endpoint, Error> {
        self.nodes
            .iter()
            .map(|node| (node.score(key), &node.endpoint))
            .max()
            .map(|(_, endpoint)| endpoint.clone())
            .ok_or_else(Error::empty_routing)
    }

    /// Up to `n` distinct endpoints for `key`, best first. `get_n(key, 1)[0] == get(key)`.
    pub fn get_n(&self, key: &str, n: usize) -> Result<Vec<Endpoint>, Error> {
        if self.nodes.is_empty() {
            return Err(Error::empty_routing());
        }
        let n = n.min(self.nodes.len());
        let mut scored: Vec<(u64, &Endpoint)> = self
            .nodes
            .iter()
            .map(|node| (node.score(key), &node.endpoint))
            .collect();
        scored.sort_unstable_by_key(|entry| Reverse(*entry));
        Ok(scored
            .into_iter()
            .take(n)
            .map(|(_, endpoint)| endpoint.clone())
            .collect())
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|node| &node.endpoint))
            .finish()
    }
}
