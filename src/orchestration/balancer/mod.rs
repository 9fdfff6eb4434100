//! Load-balanced routing with per-agent failure isolation.
//!
//! The balancer wraps the registry: an agent is routable only when the
//! registry reports it healthy and its circuit breaker allows requests.

pub mod circuit;
pub mod hash_ring;
pub mod round_robin;
pub mod weighted;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use hash_ring::{HashRing, DEFAULT_VIRTUAL_NODES};
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::core::agent::{AgentId, AgentStatus, RegisteredAgent};
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher, Subscription};
use crate::orchestration::registry::{
    AgentRegistry, CandidateSource, RegistryEvent, RegistryEventKind,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How `route` picks among healthy agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    ConsistentHash,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::WeightedRoundRobin => "weighted-round-robin",
            RoutingStrategy::ConsistentHash => "consistent-hash",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub routing: RoutingStrategy,
    /// Ring replicas per agent.
    pub virtual_nodes: usize,
    /// Consecutive failures that open an agent's circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial request.
    pub reset_timeout_ms: u64,
    /// Weight for agents without a declared one.
    pub default_weight: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            routing: RoutingStrategy::RoundRobin,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            default_weight: 1,
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(Error::Validation(
                "balancer.virtual_nodes must be at least 1".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Validation(
                "balancer.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
    }
}

/// Events emitted by the load balancer.
#[derive(Debug, Clone, PartialEq)]
pub enum BalancerEvent {
    CircuitOpened { agent_id: AgentId, failures: u32 },
    CircuitHalfOpened { agent_id: AgentId },
    CircuitClosed { agent_id: AgentId },
    MemberAdded { agent_id: AgentId },
    MemberRemoved { agent_id: AgentId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerEventKind {
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    MemberAdded,
    MemberRemoved,
}

impl Event for BalancerEvent {
    type Kind = BalancerEventKind;

    fn kind(&self) -> BalancerEventKind {
        match self {
            BalancerEvent::CircuitOpened { .. } => BalancerEventKind::CircuitOpened,
            BalancerEvent::CircuitHalfOpened { .. } => BalancerEventKind::CircuitHalfOpened,
            BalancerEvent::CircuitClosed { .. } => BalancerEventKind::CircuitClosed,
            BalancerEvent::MemberAdded { .. } => BalancerEventKind::MemberAdded,
            BalancerEvent::MemberRemoved { .. } => BalancerEventKind::MemberRemoved,
        }
    }
}

/// Routing health of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub agent_id: AgentId,
    /// `None` when the agent is not in the registry.
    pub status: Option<AgentStatus>,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Registry-healthy and circuit not open.
    pub healthy: bool,
}

pub struct LoadBalancer {
    registry: Arc<AgentRegistry>,
    config: BalancerConfig,
    round_robin: RoundRobin,
    weighted: WeightedRoundRobin,
    ring: RwLock<HashRing>,
    breakers: RwLock<HashMap<AgentId, Arc<Mutex<CircuitBreaker>>>>,
    events: EventPublisher<BalancerEvent>,
    departures: Subscription<RegistryEvent>,
    clears: Subscription<RegistryEvent>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_config(registry, BalancerConfig::default())
    }

    pub fn with_config(registry: Arc<AgentRegistry>, config: BalancerConfig) -> Self {
        let departures = registry.subscribe(Some(RegistryEventKind::Unregistered));
        let clears = registry.subscribe(Some(RegistryEventKind::Cleared));
        Self {
            registry,
            departures,
            clears,
            round_robin: RoundRobin::new(),
            weighted: WeightedRoundRobin::new(config.default_weight),
            ring: RwLock::new(HashRing::new(config.virtual_nodes)),
            breakers: RwLock::new(HashMap::new()),
            events: EventPublisher::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Agents that are registry-healthy and not circuit-tripped, in
    /// registration order.
    ///
    /// A half-open agent is listed once per trial: the call that lists it
    /// takes the trial, and later calls skip it until an outcome is recorded.
    pub fn healthy_agents(&self) -> Vec<RegisteredAgent> {
        self.registry
            .healthy_agents()
            .into_iter()
            .filter(|agent| self.circuit_allows(&agent.id))
            .collect()
    }

    /// Consistent-hash selection of `key` among `agents`.
    ///
    /// Candidates missing from the ring are added to it first; ring members
    /// that are not candidates are skipped.
    pub fn select_agent(&self, agents: &[RegisteredAgent], key: &str) -> Result<RegisteredAgent> {
        if agents.is_empty() {
            return Err(Error::NoAgentsAvailable);
        }
        self.sync_membership();
        let missing: Vec<&AgentId> = {
            let ring = self.ring.read();
            agents
                .iter()
                .map(|a| &a.id)
                .filter(|id| !ring.contains(id))
                .collect()
        };
        for id in missing {
            self.add_agent(id);
        }

        let eligible: HashSet<&AgentId> = agents.iter().map(|a| &a.id).collect();
        let owner = self
            .ring
            .read()
            .route(key, |id| eligible.contains(id))
            .cloned()
            .ok_or(Error::NoAgentsAvailable)?;
        agents
            .iter()
            .find(|a| a.id == owner)
            .cloned()
            .ok_or(Error::NoAgentsAvailable)
    }

    pub fn select_round_robin(&self, agents: &[RegisteredAgent]) -> Result<RegisteredAgent> {
        self.round_robin.select(agents).cloned()
    }

    pub fn select_weighted(&self, agents: &[RegisteredAgent]) -> Result<RegisteredAgent> {
        self.weighted.select(agents).cloned()
    }

    /// Route over the healthy agents with the configured strategy.
    pub fn route(&self, key: Option<&str>) -> Result<RegisteredAgent> {
        self.route_with(self.config.routing, key)
    }

    /// Route over the healthy agents with an explicit strategy.
    ///
    /// # Errors
    /// `Error::Validation` when consistent hashing is asked for without a key.
    pub fn route_with(&self, strategy: RoutingStrategy, key: Option<&str>) -> Result<RegisteredAgent> {
        let agents = self.healthy_agents();
        let chosen = match strategy {
            RoutingStrategy::RoundRobin => self.select_round_robin(&agents)?,
            RoutingStrategy::WeightedRoundRobin => self.select_weighted(&agents)?,
            RoutingStrategy::ConsistentHash => {
                let key = key.ok_or_else(|| {
                    Error::Validation("consistent hashing requires a routing key".to_string())
                })?;
                self.select_agent(&agents, key)?
            }
        };
        debug!(agent_id = %chosen.id, strategy = %strategy, "routed");
        Ok(chosen)
    }

    /// Add an agent to the hash ring. Returns false if already present.
    pub fn add_agent(&self, id: &AgentId) -> bool {
        let added = self.ring.write().add(id);
        if added {
            debug!(agent_id = %id, "ring member added");
            self.events.publish(BalancerEvent::MemberAdded {
                agent_id: id.clone(),
            });
        }
        added
    }

    /// Drop an agent from the ring, the weight table and the breaker table.
    pub fn remove_agent(&self, id: &AgentId) -> bool {
        let removed = self.ring.write().remove(id);
        self.weighted.forget(id);
        self.breakers.write().remove(id);
        if removed {
            debug!(agent_id = %id, "ring member removed");
            self.events.publish(BalancerEvent::MemberRemoved {
                agent_id: id.clone(),
            });
        }
        removed
    }

    pub fn set_weight(&self, id: &AgentId, weight: u32) {
        self.weighted.set_weight(id, weight);
    }

    pub fn weight(&self, id: &AgentId) -> u32 {
        self.weighted.weight(id)
    }

    /// Restart the round-robin and weighted sequences.
    pub fn reset(&self) {
        self.round_robin.reset();
        self.weighted.reset();
    }

    /// Record a failed request against `id`. Returns the breaker state after.
    ///
    /// Agents the registry does not know get no breaker and report closed.
    pub fn record_failure(&self, id: &AgentId) -> CircuitState {
        let Some(breaker) = self.breaker(id) else {
            debug!(agent_id = %id, "failure for unregistered agent ignored");
            return CircuitState::Closed;
        };
        let (transition, state, failures) = {
            let mut breaker = breaker.lock();
            let transition = breaker.record_failure();
            (transition, breaker.state(), breaker.consecutive_failures())
        };
        if self.registry.contains(id) {
            if let Err(e) = self.registry.record_failure(id) {
                debug!(agent_id = %id, error = %e, "registry failure bookkeeping skipped");
            }
        }
        if transition == Some(CircuitState::Open) {
            warn!(agent_id = %id, failures, "agent circuit opened");
            self.events.publish(BalancerEvent::CircuitOpened {
                agent_id: id.clone(),
                failures,
            });
        }
        state
    }

    /// Record a successful request against `id`. Returns the breaker state after.
    pub fn record_success(&self, id: &AgentId) -> CircuitState {
        let Some(breaker) = self.breaker(id) else {
            debug!(agent_id = %id, "success for unregistered agent ignored");
            return CircuitState::Closed;
        };
        let (transition, state) = {
            let mut breaker = breaker.lock();
            let transition = breaker.record_success();
            (transition, breaker.state())
        };
        if self.registry.contains(id) {
            if let Err(e) = self.registry.record_success(id) {
                debug!(agent_id = %id, error = %e, "registry success bookkeeping skipped");
            }
        }
        if transition == Some(CircuitState::Closed) {
            info!(agent_id = %id, "agent circuit closed");
            self.events.publish(BalancerEvent::CircuitClosed {
                agent_id: id.clone(),
            });
        }
        state
    }

    /// Force an agent's breaker closed. Returns false if it was already closed.
    pub fn reset_circuit_breaker(&self, id: &AgentId) -> bool {
        let Some(breaker) = self.existing_breaker(id) else {
            return false;
        };
        let transition = breaker.lock().reset();
        if transition.is_some() {
            info!(agent_id = %id, "agent circuit reset");
            self.events.publish(BalancerEvent::CircuitClosed {
                agent_id: id.clone(),
            });
        }
        transition.is_some()
    }

    /// Current breaker state, applying timer expiry. Closed for unknown agents.
    pub fn circuit_state(&self, id: &AgentId) -> CircuitState {
        match self.existing_breaker(id) {
            Some(breaker) => {
                self.poll_breaker(id, &breaker);
                let state = breaker.lock().state();
                state
            }
            None => CircuitState::Closed,
        }
    }

    /// # Errors
    /// `Error::AgentNotFound` when neither the registry nor the breaker table knows `id`.
    pub fn get_provider_health(&self, id: &AgentId) -> Result<ProviderHealth> {
        let agent = self.registry.get(id);
        let breaker = self.existing_breaker(id);
        if agent.is_none() && breaker.is_none() {
            return Err(Error::AgentNotFound(id.clone()));
        }
        Ok(self.health_of(id, agent.as_ref(), breaker))
    }

    /// Health of every registered agent, in registration order.
    pub fn all_provider_health(&self) -> Vec<ProviderHealth> {
        self.registry
            .all_agents()
            .iter()
            .map(|agent| self.health_of(&agent.id, Some(agent), self.existing_breaker(&agent.id)))
            .collect()
    }

    pub fn subscribe(&self, kind: Option<BalancerEventKind>) -> Subscription<BalancerEvent> {
        self.events.subscribe(kind)
    }

    pub fn unsubscribe(&self, id: uuid::Uuid) -> bool {
        self.events.unsubscribe(id)
    }

    fn health_of(
        &self,
        id: &AgentId,
        agent: Option<&RegisteredAgent>,
        breaker: Option<Arc<Mutex<CircuitBreaker>>>,
    ) -> ProviderHealth {
        let (circuit, consecutive_failures, last_failure_at) = match breaker {
            Some(breaker) => {
                self.poll_breaker(id, &breaker);
                let breaker = breaker.lock();
                (
                    breaker.state(),
                    breaker.consecutive_failures(),
                    breaker.last_failure_at(),
                )
            }
            None => (CircuitState::Closed, 0, None),
        };
        let status = agent.map(|a| a.status);
        ProviderHealth {
            agent_id: id.clone(),
            status,
            circuit,
            consecutive_failures,
            last_failure_at,
            healthy: status.is_some_and(|s| s.is_available()) && circuit != CircuitState::Open,
        }
    }

    /// Admission check. Takes the single trial slot of a half-open breaker.
    fn circuit_allows(&self, id: &AgentId) -> bool {
        match self.existing_breaker(id) {
            Some(breaker) => {
                self.poll_breaker(id, &breaker);
                let allowed = breaker.lock().can_execute();
                allowed
            }
            None => true,
        }
    }

    fn poll_breaker(&self, id: &AgentId, breaker: &Mutex<CircuitBreaker>) {
        let transition = breaker.lock().poll();
        if transition == Some(CircuitState::HalfOpen) {
            info!(agent_id = %id, "agent circuit half-open");
            self.events.publish(BalancerEvent::CircuitHalfOpened {
                agent_id: id.clone(),
            });
        }
    }

    /// Drop ring, weight and breaker state for agents that left the registry.
    fn sync_membership(&self) {
        if !self.clears.drain().is_empty() {
            debug!("registry cleared, dropping routing state");
            *self.ring.write() = HashRing::new(self.config.virtual_nodes);
            self.weighted.clear();
            self.breakers.write().clear();
        }
        for event in self.departures.drain() {
            if let RegistryEvent::Unregistered { agent_id } = event {
                self.remove_agent(&agent_id);
            }
        }
    }

    fn existing_breaker(&self, id: &AgentId) -> Option<Arc<Mutex<CircuitBreaker>>> {
        self.sync_membership();
        self.breakers.read().get(id).cloned()
    }

    fn breaker(&self, id: &AgentId) -> Option<Arc<Mutex<CircuitBreaker>>> {
        if let Some(breaker) = self.existing_breaker(id) {
            return Some(breaker);
        }
        if !self.registry.contains(id) {
            return None;
        }
        let breaker = self
            .breakers
            .write()
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    id.as_str(),
                    self.config.breaker_config(),
                )))
            })
            .clone();
        Some(breaker)
    }
}

impl CandidateSource for LoadBalancer {
    fn candidates(&self) -> Vec<RegisteredAgent> {
        self.healthy_agents()
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.config)
            .field("ring_members", &self.ring.read().len())
            .field("breakers", &self.breakers.read().len())
            .finish()
    }
}
