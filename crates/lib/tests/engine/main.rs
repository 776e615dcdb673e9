//! Engine integration tests: plan, apply, prune and destroy against the in-memory runtime.

mod apply_tests;
mod cleanup_tests;
mod common;
mod plan_tests;
