//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Registering agents with a given cost and skill set
//! - A scripted executor that records calls and fails on demand
//! - Fast execution options

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use federation::core::{AgentCapabilities, AgentId, RegisteredAgent, Subtask, SubtaskId};
use federation::orchestration::{AgentRegistry, ExecutionOptions, ExecutorError, SubtaskExecutor};

/// Build an idle agent with the given hourly cost and skills.
pub fn agent(id: &str, cost: f64, skills: &[&str]) -> RegisteredAgent {
    RegisteredAgent::new(
        id,
        "container",
        AgentCapabilities::new(cost, 1.0, 0.9).with_skills(skills.iter().copied()),
    )
}

/// A registry holding one agent per `(id, cost, skills)` entry.
pub fn registry_with(agents: &[(&str, f64, &[&str])]) -> Arc<AgentRegistry> {
    let registry = Arc::new(AgentRegistry::new());
    for (id, cost, skills) in agents {
        registry
            .register(agent(id, *cost, skills))
            .expect("Failed to register agent");
    }
    registry
}

/// Options with millisecond retry delays.
pub fn fast_options() -> ExecutionOptions {
    ExecutionOptions {
        retry_delay_ms: 2,
        max_retry_delay_ms: 20,
        ..ExecutionOptions::default()
    }
}

/// Executor whose behavior is scripted per subtask.
#[derive(Default)]
pub struct ScriptedExecutor {
    /// Remaining transient failures per subtask id.
    failures: Mutex<HashMap<String, u32>>,
    /// Subtasks that never finish on their own.
    hang: Vec<String>,
    /// `(subtask, agent)` per call, in call order.
    pub calls: Mutex<Vec<(String, String)>>,
    /// `start:<id>` / `end:<id>` markers, in order.
    pub log: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `subtask` with a retryable error `times` times, then succeed.
    pub fn fail_times(self, subtask: &str, times: u32) -> Self {
        self.failures.lock().insert(subtask.to_string(), times);
        self
    }

    /// Make `subtask` block until cancelled.
    pub fn hang_on(mut self, subtask: &str) -> Self {
        self.hang.push(subtask.to_string());
        self
    }

    pub fn calls_for(&self, subtask: &str) -> usize {
        self.calls.lock().iter().filter(|(s, _)| s == subtask).count()
    }

    pub fn agents_for(&self, subtask: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(s, _)| s == subtask)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Position of a log marker, panicking if absent.
    pub fn position(&self, marker: &str) -> usize {
        self.log
            .lock()
            .iter()
            .position(|entry| entry == marker)
            .unwrap_or_else(|| panic!("missing log marker {marker}"))
    }
}

#[async_trait]
impl SubtaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        agent_id: &AgentId,
        subtask: &Subtask,
    ) -> Result<serde_json::Value, ExecutorError> {
        let id = subtask.id.as_str().to_string();
        self.calls.lock().push((id.clone(), agent_id.as_str().to_string()));
        self.log.lock().push(format!("start:{id}"));

        if self.hang.contains(&id) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        } else {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.log.lock().push(format!("end:{id}"));

        let mut failures = self.failures.lock();
        if let Some(left) = failures.get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                return Err(ExecutorError::new("transient failure"));
            }
        }
        Ok(serde_json::json!({ "subtask": id, "agent": agent_id.as_str() }))
    }

    async fn cancel(&self, subtask_id: &SubtaskId) -> bool {
        self.cancelled.lock().push(subtask_id.as_str().to_string());
        true
    }
}
