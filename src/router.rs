//! C5: maps a request to the node that must serve it.
//!
//! Grounded on `cluster.rs`'s `route_for_command`/`RoutingInfo` (single
//! route vs. multi-node) and `slot_addr_for_route`'s master/replica
//! selection, generalized to this crate's single global read-only
//! preference instead of the teacher's richer `ReadFromReplicaStrategy`.

use crate::command_info::{is_read_only, keys_for_request, CommandInfoProvider};
use crate::error::{ClusterError, ErrorKind};
use crate::node::{Node, Shard};
use crate::resp::Request;
use crate::shard_map::ShardMap;
use crate::slot::key_to_slot;

/// `MULTI`/`EXEC` pin their whole transaction to whatever slot the caller's
/// second token names, bypassing the command-info registry entirely (spec
/// §4.4 step 1). `EXEC` submitted without a second token has no defined
/// behavior in the source this was distilled from; this crate resolves
/// that open question as **UnsupportedCommand**.
fn routing_keys(provider: &dyn CommandInfoProvider, request: &Request) -> Result<Vec<Vec<u8>>, ClusterError> {
    match request.name_lowercase().as_deref() {
        Some("multi") | Some("exec") => match request.arg(1) {
            Some(key) => Ok(vec![key.to_vec()]),
            None => Err(ClusterError::from((
                ErrorKind::UnsupportedCommand,
                "MULTI/EXEC submitted without a pinning key",
            ))),
        },
        _ => keys_for_request(provider, request).ok_or_else(|| {
            ClusterError::from((
                ErrorKind::UnsupportedCommand,
                "command not present in the command-info registry",
            ))
        }),
    }
}

/// Resolves a request to the single shard it must run against, erroring
/// with `CrossSlot` if its keys span more than one (spec §4.4 step 4),
/// or `UnsupportedCommand` if it has no keys at all — an empty key list
/// is never treated as "route anywhere" (spec §8 boundary behavior).
pub fn route<'a>(shard_map: &'a ShardMap, provider: &dyn CommandInfoProvider, request: &Request) -> Result<&'a Shard, ClusterError> {
    let keys = routing_keys(provider, request)?;
    if keys.is_empty() {
        return Err(ClusterError::from((
            ErrorKind::UnsupportedCommand,
            "request carries no routing keys",
        )));
    }
    let mut slot = None;
    for key in &keys {
        let key_slot = key_to_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(existing) if existing != key_slot => {
                return Err(ClusterError::from((ErrorKind::CrossSlot, "request keys span more than one shard")))
            }
            _ => {}
        }
    }
    shard_map
        .lookup_slot(slot.expect("keys non-empty implies a slot was computed"))
        .ok_or_else(|| ClusterError::from((ErrorKind::MissingNode, "no shard assigned to this slot yet")))
}

/// Picks the specific node within `shard` that should serve `request`
/// under the client-wide `read_only` preference (spec §4.4 step 4): the
/// master, unless the client prefers replicas, the shard has one, and the
/// command itself is read-only — in which case the **first** replica,
/// deterministically (no round-robin, spec §4.4's closing note).
pub fn pick_node(shard: &Shard, request: &Request, provider: &dyn CommandInfoProvider, read_only: bool) -> Node {
    if read_only && is_read_only(provider, request) {
        if let Some(first_replica) = shard.replicas.first() {
            return first_replica.clone();
        }
    }
    shard.master.clone()
}

/// Routes and picks the destination node for `request` in one step.
pub fn route_to_node(
    shard_map: &ShardMap,
    provider: &dyn CommandInfoProvider,
    request: &Request,
    read_only: bool,
) -> Result<Node, ClusterError> {
    let shard = route(shard_map, provider, request)?;
    Ok(pick_node(shard, request, provider, read_only))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_info::{CommandInfo, CommandInfoTable};
    use crate::node::Role;
    use std::sync::Arc;

    fn provider() -> CommandInfoTable {
        CommandInfoTable::new([
            (
                "get".to_string(),
                CommandInfo {
                    key_positions: vec![1],
                    read_only: true,
                },
            ),
            (
                "mset".to_string(),
                CommandInfo {
                    key_positions: vec![1, 3],
                    read_only: false,
                },
            ),
        ])
    }

    fn map_with_one_shard() -> ShardMap {
        let master = Node::new(b"m1".to_vec(), Role::Master, "127.0.0.1", 7000);
        let r0 = Node::new(b"r0".to_vec(), Role::Replica, "127.0.0.1", 7001);
        let r1 = Node::new(b"r1".to_vec(), Role::Replica, "127.0.0.1", 7002);
        let shard = Arc::new(Shard::new(master, vec![r0, r1]));
        let mut map = ShardMap::new();
        map.assign_range(0, 16383, shard);
        map
    }

    fn map_split_by_slot() -> ShardMap {
        let m1 = Arc::new(Shard::new(Node::new(b"m1".to_vec(), Role::Master, "127.0.0.1", 7000), vec![]));
        let m2 = Arc::new(Shard::new(Node::new(b"m2".to_vec(), Role::Master, "127.0.0.1", 7001), vec![]));
        let mut map = ShardMap::new();
        let a_slot = key_to_slot(b"a");
        let b_slot = key_to_slot(b"b");
        assert_ne!(a_slot, b_slot, "test fixture assumes a/b hash to different slots");
        map.assign_range(0, 16383, m1);
        map.assign_range(b_slot, b_slot, m2);
        map
    }

    #[test]
    fn cross_slot_request_is_rejected() {
        let map = map_split_by_slot();
        let provider = provider();
        let request = Request::from_strs(["MSET", "a", "1", "b", "2"]);
        let err = route(&map, &provider, &request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossSlot);
    }

    #[test]
    fn non_replica_preferring_client_always_picks_master() {
        let map = map_with_one_shard();
        let provider = provider();
        let request = Request::from_strs(["GET", "x"]);
        let node = route_to_node(&map, &provider, &request, false).unwrap();
        assert_eq!(node.role, Role::Master);
    }

    #[test]
    fn read_only_client_picks_first_replica_deterministically_for_read_only_command() {
        let map = map_with_one_shard();
        let provider = provider();
        let request = Request::from_strs(["GET", "x"]);
        for _ in 0..5 {
            let node = route_to_node(&map, &provider, &request, true).unwrap();
            assert_eq!(node.node_id, b"r0".to_vec());
        }
    }

    #[test]
    fn write_request_always_targets_master_even_when_client_is_read_only() {
        let map = map_with_one_shard();
        let provider = provider();
        let request = Request::from_strs(["MSET", "x", "1"]);
        let node = route_to_node(&map, &provider, &request, true).unwrap();
        assert_eq!(node.role, Role::Master);
    }

    #[test]
    fn read_only_client_on_shard_without_replicas_routes_to_master() {
        let master = Node::new(b"m1".to_vec(), Role::Master, "127.0.0.1", 7000);
        let shard = Arc::new(Shard::new(master, vec![]));
        let mut map = ShardMap::new();
        map.assign_range(0, 16383, shard);
        let provider = provider();
        let request = Request::from_strs(["GET", "x"]);
        let node = route_to_node(&map, &provider, &request, true).unwrap();
        assert_eq!(node.role, Role::Master);
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let map = map_with_one_shard();
        let provider = provider();
        let request = Request::from_strs(["FLUSHALL"]);
        let err = route(&map, &provider, &request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
    }

    #[test]
    fn multi_routes_by_second_token_bypassing_info_map() {
        let map = map_split_by_slot();
        let provider = provider();
        let request = Request::from_strs(["MULTI", "a"]);
        let shard = route(&map, &provider, &request).unwrap();
        assert_eq!(shard.master.node_id, b"m1".to_vec());
    }

    #[test]
    fn exec_without_pinning_key_is_unsupported() {
        let map = map_with_one_shard();
        let provider = provider();
        let request = Request::from_strs(["EXEC"]);
        let err = route(&map, &provider, &request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
    }
}
