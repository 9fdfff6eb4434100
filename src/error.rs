use crate::core::agent::AgentId;
use crate::core::subtask::SubtaskId;
use crate::orchestration::selector::ConstraintKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency {
        subtask: SubtaskId,
        dependency: SubtaskId,
    },

    #[error("Subtask {subtask} depends on {dependency}, which is not planned in an earlier level")]
    MisorderedDependency {
        subtask: SubtaskId,
        dependency: SubtaskId,
    },

    #[error("Duplicate subtask id: {0}")]
    DuplicateSubtask(SubtaskId),

    #[error("Unknown subtask: {0}")]
    UnknownSubtask(SubtaskId),

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    CycleDetected { cycles: Vec<Vec<SubtaskId>> },

    #[error("No agent satisfies {constraint}: {message}")]
    Selection {
        constraint: ConstraintKind,
        message: String,
    },

    #[error("Not enough candidates: requested {requested}, available {available}")]
    NotEnoughCandidates { requested: usize, available: usize },

    #[error("No agents available for routing")]
    NoAgentsAvailable,

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Execution plan is empty")]
    EmptyPlan,
}

impl Error {
    /// Whether the caller can reasonably recover (relax criteria, wait, retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Selection { .. } | Error::NotEnoughCandidates { .. } | Error::NoAgentsAvailable
        )
    }
}

fn format_cycles(cycles: &[Vec<SubtaskId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut parts: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            if let Some(first) = cycle.first() {
                parts.push(first.to_string());
            }
            parts.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!("{}", Error::Validation("bad".to_string())),
            "Validation error: bad"
        );
    }

    #[test]
    fn test_unknown_dependency_display() {
        let err = Error::UnknownDependency {
            subtask: SubtaskId::from("b"),
            dependency: SubtaskId::from("missing"),
        };
        assert_eq!(
            err.to_string(),
            "Subtask b depends on unknown subtask missing"
        );
    }

    #[test]
    fn test_cycle_display_closes_loop() {
        let err = Error::CycleDetected {
            cycles: vec![
                vec![SubtaskId::from("a"), SubtaskId::from("b")],
                vec![SubtaskId::from("c")],
            ],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: a -> b -> a; c -> c"
        );
    }

    #[test]
    fn test_selection_display_names_constraint() {
        let err = Error::Selection {
            constraint: ConstraintKind::MaxCost,
            message: "no agent at or below 3".to_string(),
        };
        assert!(err.to_string().contains("max cost"));
        assert!(err.is_recoverable());
        assert!(!Error::EmptyPlan.is_recoverable());
    }
}
