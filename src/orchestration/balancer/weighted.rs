use crate::core::agent::{AgentId, RegisteredAgent};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round robin over a pool where each agent appears `weight` times.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    weights: RwLock<HashMap<AgentId, u32>>,
    default_weight: u32,
    cursor: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new(default_weight: u32) -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
            default_weight,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Declare an agent's weight. Zero removes it from weighted routing.
    pub fn set_weight(&self, agent: &AgentId, weight: u32) {
        self.weights.write().insert(agent.clone(), weight);
    }

    pub fn weight(&self, agent: &AgentId) -> u32 {
        self.weights
            .read()
            .get(agent)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn forget(&self, agent: &AgentId) {
        self.weights.write().remove(agent);
    }

    /// Drop every declared weight.
    pub fn clear(&self) {
        self.weights.write().clear();
    }

    pub fn select<'a>(&self, agents: &'a [RegisteredAgent]) -> Result<&'a RegisteredAgent> {
        let pool: Vec<&RegisteredAgent> = {
            let weights = self.weights.read();
            agents
                .iter()
                .flat_map(|agent| {
                    let weight = weights
                        .get(&agent.id)
                        .copied()
                        .unwrap_or(self.default_weight);
                    std::iter::repeat(agent).take(weight as usize)
                })
                .collect()
        };
        if pool.is_empty() {
            return Err(Error::NoAgentsAvailable);
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(pool[position % pool.len()])
    }

    /// Clear the accumulated position.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AgentCapabilities;

    fn agents(ids: &[&str]) -> Vec<RegisteredAgent> {
        ids.iter()
            .map(|id| RegisteredAgent::new(*id, "vm", AgentCapabilities::new(1.0, 1.0, 0.9)))
            .collect()
    }

    #[test]
    fn test_ratio_follows_weights() {
        let wrr = WeightedRoundRobin::default();
        let pool = agents(&["a", "b", "c"]);
        wrr.set_weight(&AgentId::from("a"), 1);
        wrr.set_weight(&AgentId::from("b"), 2);
        wrr.set_weight(&AgentId::from("c"), 3);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..600 {
            let agent = wrr.select(&pool).unwrap();
            *counts.entry(agent.id.0.clone()).or_default() += 1;
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 200);
        assert_eq!(counts["c"], 300);
    }

    #[test]
    fn test_default_weight_applies() {
        let wrr = WeightedRoundRobin::new(2);
        assert_eq!(wrr.weight(&AgentId::from("x")), 2);
        let pool = agents(&["x", "y"]);
        let picks: Vec<_> = (0..4)
            .map(|_| wrr.select(&pool).unwrap().id.0.clone())
            .collect();
        assert_eq!(picks, vec!["x", "x", "y", "y"]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let wrr = WeightedRoundRobin::default();
        let pool = agents(&["a", "b"]);
        wrr.select(&pool).unwrap();
        wrr.reset();
        assert_eq!(wrr.select(&pool).unwrap().id.as_str(), "a");
    }

    #[test]
    fn test_zero_weights_is_error() {
        let wrr = WeightedRoundRobin::new(0);
        let pool = agents(&["a"]);
        assert!(matches!(wrr.select(&pool), Err(Error::NoAgentsAvailable)));
        wrr.set_weight(&AgentId::from("a"), 1);
        assert!(wrr.select(&pool).is_ok());
        wrr.forget(&AgentId::from("a"));
        assert!(wrr.select(&pool).is_err());
    }
}
