//! Custom Resource Definitions (CRDs) for datagrid-operator.
//!
//! - `DataGridCluster`: Deploy and manage a clustered data grid
//! - `Cache`: Declare a cache on a DataGridCluster

mod cache;
mod condition;
mod datagrid_cluster;

pub use cache::*;
pub use condition::*;
pub use datagrid_cluster::*;
