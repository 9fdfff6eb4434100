//! Authoritative in-memory registry of agents.
//!
//! Each record sits behind its own lock so concurrent heartbeats and failure
//! reports for one agent never lose updates, while updates to different
//! agents never contend. Listings take a point-in-time snapshot in
//! registration order.

use crate::core::agent::{contains_tag, validate_load, AgentId, AgentStatus, RegisteredAgent};
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher, Subscription};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Events emitted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// An agent was inserted (or its record replaced).
    Registered { agent_id: AgentId, replaced: bool },
    /// An agent was removed.
    Unregistered { agent_id: AgentId },
    /// An agent's status changed.
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    /// An agent reported a heartbeat.
    Heartbeat { agent_id: AgentId },
    /// Every agent was removed.
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    Registered,
    Unregistered,
    StatusChanged,
    Heartbeat,
    Cleared,
}

impl Event for RegistryEvent {
    type Kind = RegistryEventKind;

    fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::Registered { .. } => RegistryEventKind::Registered,
            RegistryEvent::Unregistered { .. } => RegistryEventKind::Unregistered,
            RegistryEvent::StatusChanged { .. } => RegistryEventKind::StatusChanged,
            RegistryEvent::Heartbeat { .. } => RegistryEventKind::Heartbeat,
            RegistryEvent::Cleared => RegistryEventKind::Cleared,
        }
    }
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub offline: usize,
    /// Mean load across all agents; 0 when empty.
    pub average_load: f64,
    /// Mean cost per hour across all agents; 0 when empty.
    pub average_cost: f64,
}

#[derive(Default)]
struct Slots {
    order: Vec<AgentId>,
    records: HashMap<AgentId, Arc<Mutex<RegisteredAgent>>>,
}

/// Source of candidate agents for selection.
pub trait CandidateSource: Send + Sync {
    /// Snapshot of agents currently eligible for routing, in registration order.
    fn candidates(&self) -> Vec<RegisteredAgent>;
}

/// The single source of truth for agent existence and status.
pub struct AgentRegistry {
    slots: RwLock<Slots>,
    events: EventPublisher<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            events: EventPublisher::new(),
        }
    }

    /// Insert or replace the record keyed by `agent.id`.
    ///
    /// A replaced agent keeps its original registration position.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the record's numbers are out of range.
    pub fn register(&self, agent: RegisteredAgent) -> Result<()> {
        agent.validate()?;
        let agent_id = agent.id.clone();

        let replaced = {
            let mut slots = self.slots.write();
            match slots.records.get(&agent_id) {
                Some(record) => {
                    *record.lock() = agent;
                    true
                }
                None => {
                    slots.order.push(agent_id.clone());
                    slots
                        .records
                        .insert(agent_id.clone(), Arc::new(Mutex::new(agent)));
                    false
                }
            }
        };

        info!(agent_id = %agent_id, replaced, "agent registered");
        self.events
            .publish(RegistryEvent::Registered { agent_id, replaced });
        Ok(())
    }

    /// Remove an agent, returning its last record.
    pub fn unregister(&self, id: &AgentId) -> Option<RegisteredAgent> {
        let removed = {
            let mut slots = self.slots.write();
            let record = slots.records.remove(id)?;
            slots.order.retain(|existing| existing != id);
            let snapshot = record.lock().clone();
            snapshot
        };

        info!(agent_id = %id, "agent unregistered");
        self.events.publish(RegistryEvent::Unregistered {
            agent_id: id.clone(),
        });
        Some(removed)
    }

    /// Snapshot of one agent.
    pub fn get(&self, id: &AgentId) -> Option<RegisteredAgent> {
        self.record(id).map(|record| record.lock().clone())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.slots.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set an agent's status.
    ///
    /// Moving into `Unhealthy` remembers the prior status so a later
    /// heartbeat can restore it.
    pub fn update_status(&self, id: &AgentId, status: AgentStatus) -> Result<()> {
        let from = self.with_record(id, |agent| {
            let from = agent.status;
            if status == AgentStatus::Unhealthy && from != AgentStatus::Unhealthy {
                agent.previous_status = Some(from);
            }
            agent.status = status;
            from
        })?;

        if from != status {
            debug!(agent_id = %id, %from, to = %status, "agent status changed");
            self.events.publish(RegistryEvent::StatusChanged {
                agent_id: id.clone(),
                from,
                to: status,
            });
        }
        Ok(())
    }

    /// Set an agent's load fraction.
    pub fn update_load(&self, id: &AgentId, load: f64) -> Result<()> {
        validate_load(id, load)?;
        self.with_record(id, |agent| agent.load = load)
    }

    /// Record a liveness report.
    ///
    /// Refreshes the heartbeat timestamp, clears failure bookkeeping, and
    /// restores an unhealthy agent to the status it had before.
    pub fn heartbeat(&self, id: &AgentId) -> Result<()> {
        let change = self.with_record(id, |agent| {
            agent.last_heartbeat = Utc::now();
            agent.consecutive_failures = 0;
            if agent.status == AgentStatus::Unhealthy {
                let restored = agent.previous_status.take().unwrap_or_default();
                agent.status = restored;
                Some(restored)
            } else {
                None
            }
        })?;

        self.events.publish(RegistryEvent::Heartbeat {
            agent_id: id.clone(),
        });
        if let Some(to) = change {
            info!(agent_id = %id, status = %to, "agent recovered on heartbeat");
            self.events.publish(RegistryEvent::StatusChanged {
                agent_id: id.clone(),
                from: AgentStatus::Unhealthy,
                to,
            });
        }
        Ok(())
    }

    /// Count a failed piece of work against an agent. Returns the new streak.
    pub fn record_failure(&self, id: &AgentId) -> Result<u32> {
        self.with_record(id, |agent| {
            agent.consecutive_failures = agent.consecutive_failures.saturating_add(1);
            agent.consecutive_failures
        })
    }

    /// Reset an agent's failure streak.
    pub fn record_success(&self, id: &AgentId) -> Result<()> {
        self.with_record(id, |agent| agent.consecutive_failures = 0)
    }

    /// Snapshot of every agent in registration order.
    pub fn all_agents(&self) -> Vec<RegisteredAgent> {
        let slots = self.slots.read();
        slots
            .order
            .iter()
            .filter_map(|id| slots.records.get(id))
            .map(|record| record.lock().clone())
            .collect()
    }

    /// Agents whose status is neither unhealthy nor offline.
    pub fn healthy_agents(&self) -> Vec<RegisteredAgent> {
        self.all_agents()
            .into_iter()
            .filter(RegisteredAgent::is_healthy)
            .collect()
    }

    /// Agents that declare every one of `specialties` (case-insensitive).
    pub fn find_by_specialty(&self, specialties: &[&str]) -> Vec<RegisteredAgent> {
        self.all_agents()
            .into_iter()
            .filter(|agent| {
                specialties
                    .iter()
                    .all(|s| contains_tag(&agent.capabilities.specialties, s))
            })
            .collect()
    }

    /// Agents with the given runtime label (case-insensitive).
    pub fn find_by_runtime(&self, runtime: &str) -> Vec<RegisteredAgent> {
        self.all_agents()
            .into_iter()
            .filter(|agent| agent.runtime.eq_ignore_ascii_case(runtime))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let agents = self.all_agents();
        let mut stats = RegistryStats {
            total: agents.len(),
            ..RegistryStats::default()
        };
        if agents.is_empty() {
            return stats;
        }

        for agent in &agents {
            match agent.status {
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Unhealthy => stats.unhealthy += 1,
                AgentStatus::Offline => stats.offline += 1,
            }
        }
        let n = agents.len() as f64;
        stats.average_load = agents.iter().map(|a| a.load).sum::<f64>() / n;
        stats.average_cost = agents
            .iter()
            .map(|a| a.capabilities.cost_per_hour)
            .sum::<f64>()
            / n;
        stats
    }

    /// Remove every agent.
    pub fn clear(&self) {
        {
            let mut slots = self.slots.write();
            slots.order.clear();
            slots.records.clear();
        }
        info!("agent registry cleared");
        self.events.publish(RegistryEvent::Cleared);
    }

    /// Subscribe to registry events, optionally filtered by kind.
    pub fn subscribe(&self, kind: Option<RegistryEventKind>) -> Subscription<RegistryEvent> {
        self.events.subscribe(kind)
    }

    pub fn unsubscribe(&self, id: uuid::Uuid) -> bool {
        self.events.unsubscribe(id)
    }

    fn record(&self, id: &AgentId) -> Option<Arc<Mutex<RegisteredAgent>>> {
        self.slots.read().records.get(id).cloned()
    }

    fn with_record<R>(&self, id: &AgentId, f: impl FnOnce(&mut RegisteredAgent) -> R) -> Result<R> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        let mut agent = record.lock();
        Ok(f(&mut agent))
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateSource for AgentRegistry {
    fn candidates(&self) -> Vec<RegisteredAgent> {
        self.healthy_agents()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .finish()
    }
}
