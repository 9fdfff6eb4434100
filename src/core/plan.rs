//! Leveled execution plan produced by the dependency resolver.

use crate::core::subtask::SubtaskId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ordered list of levels. Every subtask in level `k` only depends on
/// subtasks placed in levels `0..k`, so a level can run fully in parallel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    levels: Vec<Vec<SubtaskId>>,
}

impl ExecutionPlan {
    /// Build a plan from explicit levels.
    ///
    /// # Errors
    /// Returns `Error::DuplicateSubtask` if an identifier appears twice.
    pub fn new(levels: Vec<Vec<SubtaskId>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for id in levels.iter().flatten() {
            if !seen.insert(id) {
                return Err(Error::DuplicateSubtask(id.clone()));
            }
        }
        Ok(Self { levels })
    }

    /// Build a plan from string identifiers, one inner slice per level.
    pub fn from_ids(levels: &[&[&str]]) -> Result<Self> {
        Self::new(
            levels
                .iter()
                .map(|level| level.iter().map(|id| SubtaskId::from(*id)).collect())
                .collect(),
        )
    }

    pub(crate) fn from_levels_unchecked(levels: Vec<Vec<SubtaskId>>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[Vec<SubtaskId>] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Number of subtasks across all levels.
    pub fn total_subtasks(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_subtasks() == 0
    }

    /// Widest level, i.e. the peak number of concurrently dispatched subtasks.
    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Index of the level containing `id`.
    pub fn level_of(&self, id: &SubtaskId) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(id))
    }

    pub fn contains(&self, id: &SubtaskId) -> bool {
        self.level_of(id).is_some()
    }

    /// All identifiers in level order.
    pub fn subtask_ids(&self) -> impl Iterator<Item = &SubtaskId> {
        self.levels.iter().flatten()
    }
}
