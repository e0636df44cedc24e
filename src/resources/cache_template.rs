//! Default cache configuration for cache service clusters.
//!
//! Cache service clusters do not accept user templates. Every cache is a
//! synchronous distributed cache whose entries are owned by
//! `spec.service.replicationFactor` members and stored off-heap, bounded to
//! half of the container memory so the JVM keeps the other half.

use crate::controller::error::{Error, Result};
use crate::crd::DataGridCluster;
use crate::resources::common::{memory_limit, parse_memory_bytes};

/// Name of the cache every cache service cluster provides.
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Off-heap bound in megabytes.
pub fn off_heap_megabytes(resource: &DataGridCluster) -> Result<i64> {
    let memory = memory_limit(resource);
    let bytes = parse_memory_bytes(memory)
        .ok_or_else(|| Error::Validation(format!("invalid container memory '{memory}'")))?;
    Ok((bytes / 2 / (1 << 20)).max(1))
}

/// XML configuration of a cache on a cache service cluster.
pub fn default_cache_template(resource: &DataGridCluster, cache_name: &str) -> Result<String> {
    let owners = resource.spec.service.replication_factor.max(1);
    let max_size = off_heap_megabytes(resource)?;
    Ok(format!(
        r#"<infinispan><cache-container><distributed-cache name="{cache_name}" mode="SYNC" owners="{owners}" statistics="true"><memory storage="OFF_HEAP" max-size="{max_size}MB" when-full="REMOVE"/><partition-handling when-split="ALLOW_READ_WRITES" merge-policy="REMOVE_ALL"/></distributed-cache></cache-container></infinispan>"#
    ))
}
