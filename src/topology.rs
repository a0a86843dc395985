//! C8: the topology-refresh collaborator.
//!
//! Out of scope to implement here (spec §1) — the actual discovery
//! mechanism (e.g. `CLUSTER SHARDS`/`CLUSTER SLOTS`) lives with the caller.

use crate::error::ClusterError;
use crate::node_connection::NodeConnection;
use crate::shard_map::ShardMap;

/// Invoked on redirection or connection failure; must return a complete,
/// fresh `ShardMap` built via whatever discovery call the caller's server
/// supports, issued over `via`.
pub trait TopologyRefresher: Send + Sync {
    fn refresh_shard_map(&self, via: &NodeConnection) -> Result<ShardMap, ClusterError>;
}
