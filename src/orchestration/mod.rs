//! Orchestration layer of the federation engine.
//!
//! Leaf-first: the registry owns agent records, the decomposer turns a
//! description into subtasks, the selector and load balancer choose agents,
//! and the execution engine drives a leveled plan through them.

pub mod balancer;
pub mod decomposer;
pub mod engine;
pub mod registry;
pub mod selector;

pub use balancer::{
    BalancerConfig, BalancerEvent, BalancerEventKind, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, LoadBalancer, ProviderHealth, RoutingStrategy,
};
pub use decomposer::{
    DecomposeOptions, Decomposition, DecompositionStrategy, TaskDecomposer,
};
pub use engine::{
    BackoffKind, EngineEvent, EngineEventKind, ExecutionEngine, ExecutionOptions, ExecutionResult,
    ExecutorError, SubtaskError, SubtaskExecutor, SubtaskOutcome,
};
pub use registry::{AgentRegistry, CandidateSource, RegistryEvent, RegistryEventKind, RegistryStats};
pub use selector::{
    AgentSelector, ConstraintKind, ScoreBreakdown, ScoreWeights, SelectionCriteria,
    SelectionResult, SelectionStrategy,
};
