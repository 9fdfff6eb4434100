//! Subtask data model for the dependency graph.
//!
//! Subtasks are the atomic units of decomposed work routed to agents. Each
//! subtask declares the capabilities it needs and the subtasks it depends on.
//! Once placed into an execution plan a subtask is treated as immutable.

use serde::{Deserialize, Serialize};

/// Identifier for a subtask, unique within one decomposition or batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    /// Create a subtask identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubtaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single unit of decomposed work.
///
/// `required_capabilities` become hard skill constraints at selection time,
/// `preferred_capabilities` become scored bonuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier within the batch.
    pub id: SubtaskId,
    /// Short human-readable title.
    pub title: String,
    /// Longer description of the work.
    #[serde(default)]
    pub description: String,
    /// Capability tags an agent must have, in declaration order.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Capability tags that improve an agent's score.
    #[serde(default)]
    pub preferred_capabilities: Vec<String>,
    /// Identifiers of subtasks that must finish first.
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
}

impl Subtask {
    /// Create a subtask with no capabilities and no dependencies.
    pub fn new(id: impl Into<SubtaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            required_capabilities: Vec::new(),
            preferred_capabilities: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Set required capabilities. Duplicates (case-insensitive) are dropped.
    pub fn with_required<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = dedup_tags(capabilities);
        self
    }

    /// Set preferred capabilities. Duplicates (case-insensitive) are dropped.
    pub fn with_preferred<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_capabilities = dedup_tags(capabilities);
        self
    }

    /// Set dependencies. Repeated identifiers collapse into one edge.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubtaskId>,
    {
        let mut deps: Vec<SubtaskId> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        self.dependencies = deps;
        self
    }

    /// Check whether this subtask declares no dependencies.
    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Check whether all dependencies are contained in `satisfied`.
    pub fn is_ready(&self, satisfied: &std::collections::HashSet<SubtaskId>) -> bool {
        self.dependencies.iter().all(|dep| satisfied.contains(dep))
    }
}

fn dedup_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.into();
        if !out.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            out.push(tag);
        }
    }
    out
}
