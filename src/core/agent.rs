//! Agent data model: identity, capabilities, and live status.
//!
//! The registry owns the canonical [`RegisteredAgent`] records; every other
//! component works with cloned snapshots or bare [`AgentId`]s.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Live status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Available and not working.
    #[default]
    Idle,
    /// Available but currently working.
    Busy,
    /// Failing; excluded from routing until a heartbeat restores it.
    Unhealthy,
    /// Not reachable; excluded from routing.
    Offline,
}

impl AgentStatus {
    /// Whether the status allows the agent to receive work.
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Static capability bundle declared by an agent at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Cost per hour of work; must be positive.
    pub cost_per_hour: f64,
    /// Relative throughput; must be positive, higher is faster.
    pub average_speed: f64,
    /// Probability of success in `[0, 1]`.
    pub reliability: f64,
}

impl AgentCapabilities {
    pub fn new(cost_per_hour: f64, average_speed: f64, reliability: f64) -> Self {
        Self {
            skills: Vec::new(),
            languages: Vec::new(),
            specialties: Vec::new(),
            cost_per_hour,
            average_speed,
            reliability,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_specialties<I, S>(mut self, specialties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specialties = specialties.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        contains_tag(&self.skills, skill)
    }

    pub fn has_language(&self, language: &str) -> bool {
        contains_tag(&self.languages, language)
    }

    pub fn has_specialty(&self, specialty: &str) -> bool {
        contains_tag(&self.specialties, specialty)
    }
}

/// Case-insensitive tag membership.
pub fn contains_tag(tags: &[String], tag: &str) -> bool {
    tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

/// An agent record as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub id: AgentId,
    /// Workforce class label (e.g. "container", "vm", "lambda").
    pub runtime: String,
    pub capabilities: AgentCapabilities,
    pub status: AgentStatus,
    /// Fraction of capacity in use, in `[0, 1]`.
    pub load: f64,
    pub last_heartbeat: DateTime<Utc>,
    /// Status to restore when a heartbeat clears an unhealthy mark.
    #[serde(default)]
    pub previous_status: Option<AgentStatus>,
    /// Consecutive failures recorded since the last success or heartbeat.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl RegisteredAgent {
    /// Create an idle, unloaded agent with a fresh heartbeat.
    pub fn new(id: impl Into<AgentId>, runtime: &str, capabilities: AgentCapabilities) -> Self {
        Self {
            id: id.into(),
            runtime: runtime.to_string(),
            capabilities,
            status: AgentStatus::Idle,
            load: 0.0,
            last_heartbeat: Utc::now(),
            previous_status: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    /// Check the numeric invariants of the record.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::Validation("agent id must not be empty".to_string()));
        }
        let caps = &self.capabilities;
        if !(caps.cost_per_hour.is_finite() && caps.cost_per_hour > 0.0) {
            return Err(Error::Validation(format!(
                "agent {}: cost per hour must be positive, got {}",
                self.id, caps.cost_per_hour
            )));
        }
        if !(caps.average_speed.is_finite() && caps.average_speed > 0.0) {
            return Err(Error::Validation(format!(
                "agent {}: average speed must be positive, got {}",
                self.id, caps.average_speed
            )));
        }
        if !(0.0..=1.0).contains(&caps.reliability) {
            return Err(Error::Validation(format!(
                "agent {}: reliability must be in [0, 1], got {}",
                self.id, caps.reliability
            )));
        }
        validate_load(&self.id, self.load)
    }

    /// Whether the registry considers this agent routable.
    pub fn is_healthy(&self) -> bool {
        self.status.is_available()
    }
}

pub(crate) fn validate_load(id: &AgentId, load: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&load) {
        return Err(Error::Validation(format!(
            "agent {id}: load must be in [0, 1], got {load}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> AgentCapabilities {
        AgentCapabilities::new(2.5, 1.0, 0.9).with_skills(["TypeScript", "react"])
    }

    #[test]
    fn test_agent_status_display() {
        assert_eq!(AgentStatus::Idle.to_string(), "idle");
        assert_eq!(AgentStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn test_agent_status_availability() {
        assert!(AgentStatus::Idle.is_available());
        assert!(AgentStatus::Busy.is_available());
        assert!(!AgentStatus::Unhealthy.is_available());
        assert!(!AgentStatus::Offline.is_available());
    }

    #[test]
    fn test_skill_lookup_case_insensitive() {
        let caps = caps();
        assert!(caps.has_skill("typescript"));
        assert!(caps.has_skill("REACT"));
        assert!(!caps.has_skill("rust"));
    }

    #[test]
    fn test_new_agent_defaults() {
        let agent = RegisteredAgent::new("a1", "container", caps());
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.load, 0.0);
        assert!(agent.is_healthy());
        assert!(agent.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_numbers() {
        let zero_cost = RegisteredAgent::new("a", "vm", AgentCapabilities::new(0.0, 1.0, 0.5));
        assert!(zero_cost.validate().is_err());

        let slow = RegisteredAgent::new("a", "vm", AgentCapabilities::new(1.0, -1.0, 0.5));
        assert!(slow.validate().is_err());

        let unreliable = RegisteredAgent::new("a", "vm", AgentCapabilities::new(1.0, 1.0, 1.5));
        assert!(unreliable.validate().is_err());

        let overloaded = RegisteredAgent::new("a", "vm", caps()).with_load(1.2);
        assert!(overloaded.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let agent = RegisteredAgent::new("  ", "vm", caps());
        assert!(matches!(agent.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AgentStatus::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }
}
