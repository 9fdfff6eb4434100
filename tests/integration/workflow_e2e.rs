//! End-to-end workflow tests.
//!
//! A plan goes in, every subtask comes out completed, and dependency order
//! holds across levels.

use std::collections::BTreeSet;
use std::sync::Arc;

use federation::core::{ExecutionPlan, Subtask, SubtaskId};
use federation::orchestration::{
    AgentRegistry, DecomposeOptions, DecompositionStrategy, EngineEvent, EngineEventKind,
    ExecutionEngine, SubtaskOutcome, TaskDecomposer,
};
use tokio_test::assert_ok;

use crate::fixtures::{agent, fast_options, registry_with, ScriptedExecutor};

fn two_level_plan() -> (ExecutionPlan, Vec<Subtask>) {
    let subtasks = vec![
        Subtask::new("A", "schema").with_required(["sql"]),
        Subtask::new("B", "service").with_required(["rust"]),
        Subtask::new("C", "integration")
            .with_required(["rust"])
            .with_dependencies(["A", "B"]),
    ];
    let plan = ExecutionPlan::from_ids(&[&["A", "B"], &["C"]]).expect("valid plan");
    (plan, subtasks)
}

/// Test: Two-level plan
/// Given levels [[A, B], [C]] and agents covering every skill
/// When the plan is executed
/// Then all three subtasks complete and C starts after A and B end
#[tokio::test]
async fn test_two_level_plan_completes() {
    let registry = registry_with(&[
        ("db-agent", 2.0, &["sql"]),
        ("rust-agent", 3.0, &["rust"]),
    ]);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor.clone());
    let (plan, subtasks) = two_level_plan();

    let result = assert_ok!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);

    assert_eq!(result.total_tasks, 3);
    assert_eq!(result.completed, 3);
    assert_eq!(result.failed, 0);
    assert!(result.is_success());
    assert_eq!(result.results.len(), 3);

    assert!(executor.position("start:C") > executor.position("end:A"));
    assert!(executor.position("start:C") > executor.position("end:B"));

    // Hard skill constraints decide the agent.
    assert_eq!(executor.agents_for("A"), vec!["db-agent".to_string()]);
    assert_eq!(executor.agents_for("B"), vec!["rust-agent".to_string()]);

    match result.outcome(&SubtaskId::from("C")) {
        Some(SubtaskOutcome::Completed {
            agent_id, attempts, ..
        }) => {
            assert_eq!(agent_id.as_str(), "rust-agent");
            assert_eq!(*attempts, 1);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

/// Test: Decompose then execute
/// Given a numbered task description
/// When it is decomposed and the decomposition executed
/// Then every subtask completes after all of its dependencies
#[tokio::test]
async fn test_decompose_then_execute() {
    let description = "1. Design the database schema for orders\n\
                       2. Implement the REST API endpoints\n\
                       3. Write integration tests for the API\n\
                       4. Document the public endpoints";
    let decomposition = assert_ok!(TaskDecomposer::new().decompose(
        description,
        &DecomposeOptions::with_strategy(DecompositionStrategy::ComponentBased),
    ));
    assert_eq!(decomposition.subtasks.len(), 4);
    assert!(decomposition.levels.level_count() >= 2);

    // One generalist that holds every inferred capability.
    let skills: BTreeSet<&str> = decomposition
        .subtasks
        .iter()
        .flat_map(|s| s.required_capabilities.iter().map(String::as_str))
        .collect();
    let skills: Vec<&str> = skills.into_iter().collect();
    let registry = Arc::new(AgentRegistry::new());
    assert_ok!(registry.register(agent("generalist", 4.0, &skills)));

    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor.clone());
    let result = assert_ok!(engine.execute(&decomposition, &fast_options()).await);

    assert_eq!(result.completed, decomposition.subtasks.len());
    assert_eq!(result.failed, 0);
    for subtask in &decomposition.subtasks {
        for dependency in &subtask.dependencies {
            assert!(
                executor.position(&format!("start:{}", subtask.id))
                    > executor.position(&format!("end:{}", dependency)),
                "{} started before {} finished",
                subtask.id,
                dependency
            );
        }
    }
}

/// Test: Event stream
/// Given a subscriber for completion events
/// When a plan runs
/// Then one SubtaskCompleted event arrives per subtask
#[tokio::test]
async fn test_completion_events_per_subtask() {
    let registry = registry_with(&[("any", 1.0, &["sql", "rust"])]);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = ExecutionEngine::new(registry, executor);
    let completions = engine.subscribe(Some(EngineEventKind::SubtaskCompleted));
    let (plan, subtasks) = two_level_plan();

    assert_ok!(engine.execute_plan(&plan, &subtasks, &fast_options()).await);

    let mut completed: Vec<String> = completions
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::SubtaskCompleted { subtask_id, .. } => Some(subtask_id.to_string()),
            _ => None,
        })
        .collect();
    completed.sort();
    assert_eq!(completed, vec!["A", "B", "C"]);
}
