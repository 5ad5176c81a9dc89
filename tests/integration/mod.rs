//! Integration test suite for maestro.
//!
//! These tests exercise full runs of the orchestration driver against
//! scripted workers: dependency-ordered execution, parallel batches,
//! event durability across simulated crashes, gate and council behavior,
//! and hook fault isolation.
//!
//! No test calls a real model backend; every worker is a scripted mock,
//! so the suite is safe for CI.

mod fixtures;

mod build_e2e;
mod durability;
mod gating;
mod lifecycle;
