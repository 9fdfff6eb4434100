//! Consistent-hash ring with virtual nodes.

use crate::core::agent::AgentId;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Stable 64-bit position on the ring.
fn position(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn replica_key(agent: &AgentId, replica: usize) -> String {
    format!("{}#{}", agent, replica)
}

#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u64, AgentId>,
    members: HashSet<AgentId>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
            members: HashSet::new(),
        }
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.members.contains(agent)
    }

    /// Insert the agent's replicas. Returns false if already a member.
    pub fn add(&mut self, agent: &AgentId) -> bool {
        if !self.members.insert(agent.clone()) {
            return false;
        }
        for replica in 0..self.virtual_nodes {
            self.ring
                .insert(position(&replica_key(agent, replica)), agent.clone());
        }
        true
    }

    /// Remove the agent's replicas. Returns false if not a member.
    pub fn remove(&mut self, agent: &AgentId) -> bool {
        if !self.members.remove(agent) {
            return false;
        }
        for replica in 0..self.virtual_nodes {
            let point = position(&replica_key(agent, replica));
            if self.ring.get(&point) == Some(agent) {
                self.ring.remove(&point);
            }
        }
        true
    }

    /// First replica clockwise from `key` whose agent passes `eligible`.
    pub fn route<F>(&self, key: &str, eligible: F) -> Option<&AgentId>
    where
        F: Fn(&AgentId) -> bool,
    {
        let start = position(key);
        self.ring
            .range(start..)
            .chain(self.ring.range(..start))
            .map(|(_, agent)| agent)
            .find(|agent| eligible(agent))
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
