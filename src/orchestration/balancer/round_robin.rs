use crate::core::agent::RegisteredAgent;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cycles through candidates in the order given.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<'a>(&self, agents: &'a [RegisteredAgent]) -> Result<&'a RegisteredAgent> {
        if agents.is_empty() {
            return Err(Error::NoAgentsAvailable);
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(&agents[position % agents.len()])
    }

    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}
