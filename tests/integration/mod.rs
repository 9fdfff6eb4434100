//! Integration test suite for the federation engine.
//!
//! These tests drive the public API end to end: registering agents,
//! decomposing work, routing through the load balancer and running leveled
//! plans through the execution engine.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Plans and decompositions run to completion
//! - `routing`: Selection strategies and load balancing
//! - `recovery`: Retries, exhausted pools, cancellation and cycles
//!
//! # CI Compatibility
//!
//! Work is done by an in-process scripted executor, so no agent process or
//! network access is needed.

mod fixtures;

mod recovery;
mod routing;
mod workflow_e2e;
