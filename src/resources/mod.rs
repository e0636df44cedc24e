//! Resource generation module.
//!
//! Contains utilities for generating Kubernetes resources owned by DataGridCluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | Stable pod identity and storage for the servers |
//! | Ping Service | Member discovery (publishNotReadyAddresses) |
//! | Client Service | Client access endpoint |
//! | Admin Service | Operator access to the admin endpoint |
//! | External Service | Optional NodePort or LoadBalancer exposure |
//! | Secrets | Operator and application identities |

pub mod cache_template;
pub mod common;
pub mod secrets;
pub mod services;
pub mod statefulset;

// Re-export commonly used items from common
pub use common::{owner_reference, pod_selector_labels, standard_labels};
