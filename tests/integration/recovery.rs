//! Failure handling and recovery integration tests.
//!
//! These tests verify that transient failures are retried, exhausted agent
//! pools fail cleanly, cancellation stops a run, and cyclic dependencies
//! are rejected before anything executes.

use std::sync::Arc;
use std::time::Duration;

use federation::core::{DependencyGraph, ExecutionPlan, Subtask, SubtaskId};
use federation::orchestration::{
    AgentRegistry, ExecutionEngine, ExecutionOptions, SubtaskOutcome,
};
use federation::Error;
use tokio_util::sync::CancellationToken;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{fast_options, registry_with, ScriptedExecutor};

fn abc() -> (ExecutionPlan, Vec<Subtask>) {
    let subtasks = vec![
        Subtask::new("A", "first").with_required(["rust"]),
        Subtask::new("B", "second").with_required(["rust"]),
        Subtask::new("C", "third")
            .with_required(["rust"])
            .with_dependencies(["A", "B"]),
    ];
    let plan = ExecutionPlan::from_ids(&[&["A", "B"], &["C"]]).expect("valid plan");
    (plan, subtasks)
}

/// Test: Transient failure retry
/// Given a subtask that fails twice before succeeding
/// When executed with three retries allowed
/// Then it is called three times and the run succeeds
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let registry = registry_with(&[("solo", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new().fail_times("A", 2));
    let engine = ExecutionEngine::new(registry, executor.clone());
    let (plan, subtasks) = abc();

    let result = assert_ok!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);

    assert_eq!(executor.calls_for("A"), 3);
    assert_eq!(result.completed, 3);
    assert_eq!(
        result.outcome(&SubtaskId::from("A")).map(SubtaskOutcome::attempts),
        Some(3)
    );
}

/// Test: Retry moves to another agent
/// Given two capable agents and a subtask that fails once
/// When it is retried
/// Then the second attempt goes to the other agent
#[tokio::test]
async fn test_retry_prefers_another_agent() {
    let registry = registry_with(&[("first", 1.0, &["rust"]), ("second", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new().fail_times("A", 1));
    let engine = ExecutionEngine::new(registry, executor.clone());
    let subtasks = vec![Subtask::new("A", "only").with_required(["rust"])];
    let plan = ExecutionPlan::from_ids(&[&["A"]]).expect("valid plan");

    let result = assert_ok!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);

    assert_eq!(result.completed, 1);
    let agents = executor.agents_for("A");
    assert_eq!(agents.len(), 2);
    assert_ne!(agents[0], agents[1]);
}

/// Test: No agents at all
/// Given an empty registry
/// When a plan is executed
/// Then the run returns normally with every subtask failed
#[tokio::test]
async fn test_empty_registry_fails_every_subtask() {
    let registry = Arc::new(AgentRegistry::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor.clone());
    let (plan, subtasks) = abc();
    let options = ExecutionOptions {
        retry_attempts: 1,
        ..fast_options()
    };

    let result = assert_ok!(engine.execute_plan(&plan, &subtasks, &options).await);

    assert_eq!(result.completed, 0);
    assert_eq!(result.failed, result.total_tasks);
    assert_eq!(result.errors.len(), 3);
    assert!(!result.is_success());
    assert!(executor.calls.lock().is_empty());
}

/// Test: Cancellation
/// Given a subtask that never finishes
/// When the caller's token is cancelled mid-run
/// Then the hung subtask and everything after it is cancelled
#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let registry = registry_with(&[("solo", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new().hang_on("B"));
    let engine = ExecutionEngine::new(registry, executor.clone());
    let (plan, subtasks) = abc();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = assert_ok!(
        engine
            .execute_plan_with_token(&plan, &subtasks, &fast_options(), token)
            .await
    );

    assert_eq!(result.completed, 1);
    assert_eq!(result.cancelled, 2);
    assert_eq!(result.completed + result.failed, result.total_tasks);
    assert_eq!(*executor.cancelled.lock(), vec!["B".to_string()]);
    assert_eq!(executor.calls_for("C"), 0);
    assert!(matches!(
        result.outcome(&SubtaskId::from("C")),
        Some(SubtaskOutcome::Cancelled { .. })
    ));
}

/// Test: Malformed plans
/// Given a plan naming a subtask that was never supplied
/// When executed
/// Then the engine rejects it before running anything
#[tokio::test]
async fn test_unknown_subtask_rejected() {
    let registry = registry_with(&[("solo", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor.clone());
    let (_, subtasks) = abc();
    let plan = ExecutionPlan::from_ids(&[&["A", "ghost"]]).expect("valid plan");

    let err = assert_err!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);
    assert!(matches!(err, Error::UnknownSubtask(id) if id.as_str() == "ghost"));
    assert!(executor.calls.lock().is_empty());
}

/// Test: Dependency cycle
/// Given A -> B -> C -> A
/// When a plan is requested
/// Then CycleDetected reports all three members
#[test]
fn test_cycle_is_reported() {
    let graph = assert_ok!(DependencyGraph::from_subtasks(vec![
        Subtask::new("A", "a").with_dependencies(["C"]),
        Subtask::new("B", "b").with_dependencies(["A"]),
        Subtask::new("C", "c").with_dependencies(["B"]),
    ]));
    assert!(graph.has_cycles());

    match assert_err!(graph.execution_plan()) {
        Error::CycleDetected { cycles } => {
            assert_eq!(cycles.len(), 1);
            let mut members: Vec<String> = cycles[0].iter().map(|id| id.to_string()).collect();
            members.sort();
            assert_eq!(members, vec!["A", "B", "C"]);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
    assert_err!(graph.topological_sort());
}

/// Test: Self-dependency
/// Given a subtask that depends on itself
/// Then it is reported as a cycle of one
#[test]
fn test_self_dependency_is_a_cycle() {
    let graph = assert_ok!(DependencyGraph::from_subtasks(vec![
        Subtask::new("loop", "self").with_dependencies(["loop"]),
        Subtask::new("free", "independent"),
    ]));

    assert_eq!(graph.detect_cycles(), vec![vec![SubtaskId::from("loop")]]);
    assert!(matches!(
        graph.execution_plan(),
        Err(Error::CycleDetected { .. })
    ));
}

/// Test: Blocking entry point
/// Given a runtime-free caller
/// When a plan is driven with block_on
/// Then it completes like the async path
#[test]
fn test_block_on_runs_plan() {
    let registry = registry_with(&[("solo", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor);
    let (plan, subtasks) = abc();

    let result = tokio_test::block_on(engine.execute_plan(&plan, &subtasks, &fast_options()));
    let result = assert_ok!(result);
    assert_eq!(result.completed, 3);
}

/// Test: Plan out of dependency order
/// Given C depends on A but the plan runs C first
/// When executed
/// Then the engine rejects it before running anything
#[tokio::test]
async fn test_inverted_plan_rejected() {
    let registry = registry_with(&[("solo", 1.0, &["rust"])]);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor.clone());
    let subtasks = vec![
        Subtask::new("A", "first").with_required(["rust"]),
        Subtask::new("C", "third")
            .with_required(["rust"])
            .with_dependencies(["A"]),
    ];
    let plan = ExecutionPlan::from_ids(&[&["C"], &["A"]]).expect("valid plan");

    let err = assert_err!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);
    assert!(matches!(
        err,
        Error::MisorderedDependency { subtask, dependency }
            if subtask.as_str() == "C" && dependency.as_str() == "A"
    ));
    assert!(executor.calls.lock().is_empty());
}
