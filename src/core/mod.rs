//! Core domain models for the federation engine.
//!
//! This module contains the fundamental data structures used throughout
//! orchestration: subtasks, agents, the dependency graph, and execution plans.

pub mod agent;
pub mod dag;
pub mod plan;
pub mod subtask;

pub use agent::{AgentCapabilities, AgentId, AgentStatus, RegisteredAgent};
pub use dag::{DependencyGraph, GraphEntry, GraphStatistics};
pub use plan::ExecutionPlan;
pub use subtask::{Subtask, SubtaskId};
