//! Controller module for datagrid-operator.
//!
//! Contains the reconciliation loops, state machines, error handling, status
//! management and the server event listener.
//!
//! This module supports two controllers:
//! - DataGridCluster controller (cluster_* modules, membership, upgrade_state_machine)
//! - Cache controller (cache_* modules)

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod retry;
pub mod status;

// DataGridCluster controller
pub mod cluster_reconciler;
pub mod cluster_state_machine;
pub mod cluster_topology;
pub mod membership;
pub mod upgrade_state_machine;

// Cache controller
pub mod cache_listener;
pub mod cache_reconciler;
