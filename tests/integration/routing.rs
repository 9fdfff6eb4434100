//! Selection and load-balancing integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use federation::core::{AgentId, AgentStatus};
use federation::orchestration::{
    AgentRegistry, AgentSelector, BalancerConfig, CircuitState, ConstraintKind, LoadBalancer,
    RoutingStrategy, SelectionCriteria, SelectionStrategy,
};
use federation::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::registry_with;

fn three_agents() -> Arc<AgentRegistry> {
    registry_with(&[
        ("a", 1.0, &["general"]),
        ("b", 1.0, &["general"]),
        ("c", 1.0, &["general"]),
    ])
}

fn tally(balancer: &LoadBalancer, rounds: usize) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..rounds {
        let chosen = assert_ok!(balancer.route(None));
        *counts.entry(chosen.id.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Test: Cost-optimized selection
/// Given three rust agents with different hourly costs
/// When selecting with the cost strategy
/// Then the cheapest agent wins and the others rank below it
#[test]
fn test_cost_strategy_picks_cheapest() {
    let registry = registry_with(&[
        ("premium", 9.0, &["rust"]),
        ("budget", 1.0, &["rust"]),
        ("standard", 4.0, &["rust"]),
    ]);
    let selector = AgentSelector::new(registry);
    let criteria =
        SelectionCriteria::new(SelectionStrategy::CostOptimized).require_skills(["rust"]);

    let result = assert_ok!(selector.select_agent(&criteria));
    assert_eq!(result.agent_id().as_str(), "budget");
    assert_eq!(result.candidates_considered, 3);

    let ranked: Vec<String> = selector
        .rank_agents(&criteria)
        .into_iter()
        .map(|r| r.agent_id().to_string())
        .collect();
    assert_eq!(ranked, vec!["budget", "standard", "premium"]);
}

/// Test: Constraint reporting
/// Given agents that all exceed a cost ceiling
/// When selecting
/// Then the error names the cost constraint
#[test]
fn test_selection_names_eliminating_constraint() {
    let registry = registry_with(&[("a", 5.0, &["rust"]), ("b", 6.0, &["rust"])]);
    let selector = AgentSelector::new(registry);
    let criteria = SelectionCriteria::default()
        .require_skills(["rust"])
        .max_cost(2.0);

    match assert_err!(selector.select_agent(&criteria)) {
        Error::Selection { constraint, .. } => assert_eq!(constraint, ConstraintKind::MaxCost),
        other => panic!("expected selection error, got {:?}", other),
    }
}

/// Test: Round-robin fairness
/// Given three healthy agents
/// When routing 300 requests
/// Then each agent receives exactly 100
#[test]
fn test_round_robin_is_even() {
    let registry = three_agents();
    let balancer = LoadBalancer::new(registry);

    let counts = tally(&balancer, 300);
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 100));
}

/// Test: Weighted round-robin
/// Given weights 1, 2 and 3
/// When routing 600 requests
/// Then traffic splits 100 / 200 / 300
#[test]
fn test_weighted_round_robin_follows_weights() {
    let registry = three_agents();
    let config = BalancerConfig {
        routing: RoutingStrategy::WeightedRoundRobin,
        ..BalancerConfig::default()
    };
    let balancer = LoadBalancer::with_config(registry, config);
    balancer.set_weight(&AgentId::from("b"), 2);
    balancer.set_weight(&AgentId::from("c"), 3);

    let counts = tally(&balancer, 600);
    assert_eq!(counts["a"], 100);
    assert_eq!(counts["b"], 200);
    assert_eq!(counts["c"], 300);
}

/// Test: Consistent hashing
/// Given a hash-routed balancer
/// When the same key is routed repeatedly, then its owner goes offline
/// Then the key sticks to one agent and only moves once that agent is gone
#[test]
fn test_consistent_hash_is_sticky() {
    let registry = three_agents();
    let config = BalancerConfig {
        routing: RoutingStrategy::ConsistentHash,
        ..BalancerConfig::default()
    };
    let balancer = LoadBalancer::with_config(registry.clone(), config);

    let owner = assert_ok!(balancer.route(Some("session-42"))).id;
    for _ in 0..20 {
        assert_eq!(assert_ok!(balancer.route(Some("session-42"))).id, owner);
    }

    assert_ok!(registry.update_status(&owner, AgentStatus::Offline));
    let moved = assert_ok!(balancer.route(Some("session-42"))).id;
    assert_ne!(moved, owner);

    assert!(matches!(
        balancer.route(None),
        Err(Error::Validation(_))
    ));
}

/// Test: Circuit breaker isolation
/// Given a failure threshold of 2
/// When one agent fails twice
/// Then its circuit opens and routing avoids it until it recovers
#[test]
fn test_open_circuit_is_skipped() {
    let registry = registry_with(&[("a", 1.0, &["general"]), ("b", 1.0, &["general"])]);
    let config = BalancerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 60_000,
        ..BalancerConfig::default()
    };
    let balancer = LoadBalancer::with_config(registry, config);
    let a = AgentId::from("a");

    assert_eq!(balancer.record_failure(&a), CircuitState::Closed);
    assert_eq!(balancer.record_failure(&a), CircuitState::Open);

    let counts = tally(&balancer, 10);
    assert_eq!(counts.get("a"), None);
    assert_eq!(counts["b"], 10);

    let health = assert_ok!(balancer.get_provider_health(&a));
    assert_eq!(health.circuit, CircuitState::Open);
    assert!(!health.healthy);
    assert_eq!(health.consecutive_failures, 2);

    assert!(balancer.reset_circuit_breaker(&a));
    assert_eq!(balancer.circuit_state(&a), CircuitState::Closed);
    assert!(tally(&balancer, 10).contains_key("a"));
}

/// Test: Selection through the balancer
/// Given a selector reading candidates from the balancer
/// When the best agent's circuit is open
/// Then the selector falls back to the next best
#[test]
fn test_selector_over_balancer_skips_open_circuits() {
    let registry = registry_with(&[("cheap", 1.0, &["rust"]), ("pricey", 8.0, &["rust"])]);
    let balancer = Arc::new(LoadBalancer::with_config(
        registry,
        BalancerConfig {
            failure_threshold: 1,
            ..BalancerConfig::default()
        },
    ));
    let selector = AgentSelector::new(balancer.clone());
    let criteria =
        SelectionCriteria::new(SelectionStrategy::CostOptimized).require_skills(["rust"]);

    assert_eq!(
        assert_ok!(selector.select_agent(&criteria)).agent_id().as_str(),
        "cheap"
    );
    balancer.record_failure(&AgentId::from("cheap"));
    assert_eq!(
        assert_ok!(selector.select_agent(&criteria)).agent_id().as_str(),
        "pricey"
    );
}
