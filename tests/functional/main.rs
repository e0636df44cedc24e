// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the DataGridCluster and Cache controllers.
//!
//! These tests drive the real reconcilers and the cache event listener
//! WITHOUT a live Kubernetes cluster or data grid server. An in-memory
//! resource store and a fake server stand in for both.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_graceful_shutdown_and_restart
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Cluster tests**: formation, validation, graceful shutdown, upgrades
//! - **Cache tests**: pushing declared caches to the server, deletion, policies
//! - **Listener tests**: mirroring server changes into Cache resources

mod cluster_tests;
mod listener_tests;

// Re-export for use in tests
pub use mock_state::*;
