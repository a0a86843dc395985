//! C7: the top-level handle — owns the node-connection table, the current
//! pipeline cell, and the shared shard-map cell.
//!
//! Grounded on `cluster.rs`'s `ClusterConnection::new`/`create_initial_connections`
//! (eager per-node dial, refresh-and-retry on partial bootstrap failure)
//! and `cluster_async/mod.rs`'s use of `tracing` for connection-lifecycle
//! diagnostics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::command_info::CommandInfoProvider;
use crate::config::Config;
use crate::error::{read_or_diagnose, write_or_diagnose, ClusterError, ErrorKind};
use crate::node::Node;
use crate::node_connection::{NodeConnection, OpenSocket};
use crate::pipeline::{self, DeferredReply, Pipeline, PipelineContext};
use crate::resp::{Reply, Request};
use crate::shard_map::ShardMap;
use crate::topology::TopologyRefresher;

struct ConnectionInner {
    node_conns: RwLock<HashMap<Vec<u8>, Arc<NodeConnection>>>,
    shard_map: ArcSwap<ShardMap>,
    command_info: Arc<dyn CommandInfoProvider>,
    opener: Arc<dyn OpenSocket>,
    refresher: Arc<dyn TopologyRefresher>,
    config: Config,
}

impl ConnectionInner {
    fn any_node_connection(&self) -> Option<Arc<NodeConnection>> {
        read_or_diagnose(&self.node_conns, "ConnectionInner::node_conns").values().next().cloned()
    }
}

impl PipelineContext for ConnectionInner {
    fn shard_map(&self) -> Arc<ShardMap> {
        self.shard_map.load_full()
    }

    fn command_info(&self) -> &dyn CommandInfoProvider {
        self.command_info.as_ref()
    }

    fn read_only(&self) -> bool {
        self.config.read_only
    }

    fn node_request_deadline(&self) -> Duration {
        self.config.node_request_deadline
    }

    fn node_connection(&self, node: &Node) -> Option<Arc<NodeConnection>> {
        read_or_diagnose(&self.node_conns, "ConnectionInner::node_conns")
            .get(&node.node_id)
            .cloned()
    }

    fn alternate_node_connection(&self, exclude: &Node) -> Option<Arc<NodeConnection>> {
        read_or_diagnose(&self.node_conns, "ConnectionInner::node_conns")
            .iter()
            .find(|(id, _)| id.as_slice() != exclude.node_id.as_slice())
            .map(|(_, nc)| Arc::clone(nc))
    }

    fn ensure_node_connection(&self, node: &Node) -> Result<Arc<NodeConnection>, ClusterError> {
        if let Some(existing) = read_or_diagnose(&self.node_conns, "ConnectionInner::node_conns")
            .get(&node.node_id)
            .cloned()
        {
            return Ok(existing);
        }
        let nc = Arc::new(NodeConnection::new(node.clone(), Arc::clone(&self.opener), self.config.timeout)?);
        let mut conns = write_or_diagnose(&self.node_conns, "ConnectionInner::node_conns");
        Ok(Arc::clone(conns.entry(node.node_id.clone()).or_insert(nc)))
    }

    fn refresh_shard_map(&self) -> Result<(), ClusterError> {
        let via = self
            .any_node_connection()
            .ok_or_else(|| ClusterError::from((ErrorKind::NoNode, "no connection available to refresh topology")))?;
        let fresh = self.refresher.refresh_shard_map(&via)?;
        info!(slots = fresh.all_nodes().len(), "shard map refreshed");
        self.shard_map.store(Arc::new(fresh));
        Ok(())
    }
}

/// Top-level handle (spec §3's `Connection`). Producers may submit
/// concurrently; see spec §5 for the concurrency model realized by
/// `ConnectionInner`'s locks and the pipeline cell below.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    pipeline_cell: Mutex<Arc<Pipeline>>,
}

impl Connection {
    /// Opens a socket to every unique node in `initial_shard_map`. If at
    /// least one dial succeeds but not all did, one surviving connection
    /// is used to fetch a fresh `ShardMap` via `refresh_shard_map`, and the
    /// node table is rebuilt against that fresh map, reusing any
    /// connections already open. If zero connections succeed, fails with
    /// `NoNode` (spec §4.7).
    pub fn connect(
        open_socket: Arc<dyn OpenSocket>,
        command_info: Arc<dyn CommandInfoProvider>,
        initial_shard_map: ShardMap,
        refresh_shard_map: Arc<dyn TopologyRefresher>,
        config: Config,
    ) -> Result<Self, ClusterError> {
        let mut node_conns: HashMap<Vec<u8>, Arc<NodeConnection>> = HashMap::new();
        let mut any_failed = false;
        for node in initial_shard_map.all_nodes() {
            match NodeConnection::new(node.clone(), Arc::clone(&open_socket), config.timeout) {
                Ok(nc) => {
                    node_conns.insert(node.node_id.clone(), Arc::new(nc));
                }
                Err(err) => {
                    warn!(host = %node.host, port = node.port, error = %err, "failed to dial node during connect");
                    any_failed = true;
                }
            }
        }

        if node_conns.is_empty() {
            return Err(ClusterError::from((ErrorKind::NoNode, "failed to open any node connection")));
        }

        let shard_map = if any_failed {
            let via = node_conns.values().next().cloned().expect("checked non-empty above");
            let fresh = refresh_shard_map.refresh_shard_map(&via)?;
            let mut rebuilt = HashMap::new();
            for node in fresh.all_nodes() {
                let nc = match node_conns.remove(&node.node_id) {
                    Some(existing) => existing,
                    None => Arc::new(NodeConnection::new(node.clone(), Arc::clone(&open_socket), config.timeout)?),
                };
                rebuilt.insert(node.node_id.clone(), nc);
            }
            node_conns = rebuilt;
            fresh
        } else {
            initial_shard_map
        };

        info!(nodes = node_conns.len(), "cluster connection established");

        let inner = Arc::new(ConnectionInner {
            node_conns: RwLock::new(node_conns),
            shard_map: ArcSwap::new(Arc::new(shard_map)),
            command_info,
            opener: open_socket,
            refresher: refresh_shard_map,
            config,
        });

        Ok(Connection {
            inner,
            pipeline_cell: Mutex::new(Arc::new(Pipeline::fresh())),
        })
    }

    /// Best-effort close of every node connection; errors are swallowed
    /// (spec §4.7) since there is nothing left to report to once the
    /// handle itself is being torn down.
    pub fn disconnect(self) {
        let mut conns = write_or_diagnose(&self.inner.node_conns, "ConnectionInner::node_conns");
        let count = conns.len();
        conns.clear();
        info!(nodes = count, "cluster connection closed");
    }

    pub fn request_pipelined(&self, request: Request) -> DeferredReply {
        let context: Arc<dyn PipelineContext> = self.inner.clone();
        pipeline::request_pipelined(context, &self.pipeline_cell, request, self.inner.config.pipeline_flush_threshold)
    }

    /// Sends `request` once to every master in the current ShardMap,
    /// returning the concatenated replies (spec §6).
    pub fn request_master_nodes(&self, request: &Request) -> Result<Vec<Reply>, ClusterError> {
        let shard_map = self.inner.shard_map();
        let mut replies = Vec::new();
        for master in shard_map.master_nodes() {
            let nc = self
                .inner
                .node_connection(&master)
                .ok_or_else(|| ClusterError::from((ErrorKind::MissingNode, "no connection for master node")))?;
            let mut reply = nc.request_node(std::slice::from_ref(request), self.inner.config.node_request_deadline)?;
            replies.push(reply.remove(0));
        }
        Ok(replies)
    }

    pub fn shard_map(&self) -> Arc<ShardMap> {
        self.inner.shard_map()
    }

    /// Opens a connection to `node` if this handle doesn't already have one
    /// under that node identity. This is for the narrower case of a
    /// Connection that has lost all of its sockets and a caller wants to
    /// proactively re-establish a specific node ahead of any pipeline
    /// activity (spec §9 open question 4). The MOVED/ASK redirect path does
    /// not depend on this — `ensure_node_connection` dials redirect targets
    /// lazily as part of the retry itself.
    pub fn reconnect_node(&self, node: &Node) -> Result<(), ClusterError> {
        let mut conns = write_or_diagnose(&self.inner.node_conns, "ConnectionInner::node_conns");
        if conns.contains_key(&node.node_id) {
            return Ok(());
        }
        let nc = NodeConnection::new(node.clone(), Arc::clone(&self.inner.opener), self.inner.config.timeout)?;
        conns.insert(node.node_id.clone(), Arc::new(nc));
        Ok(())
    }
}

/// `nodes(shard_map) -> [Node]` (spec §6): every master and replica,
/// deduplicated, in no particular order.
pub fn nodes(shard_map: &ShardMap) -> Vec<Node> {
    shard_map.all_nodes().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_info::CommandInfoTable;
    use crate::node::{Role, Shard};
    use crate::node_connection::Transport;
    use std::sync::Mutex as StdMutex;

    struct NullTransport;
    impl Transport for NullTransport {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), ClusterError> {
            Ok(())
        }
        fn read_some(&mut self, _buf: &mut [u8]) -> Result<usize, ClusterError> {
            Ok(0)
        }
    }

    struct AlwaysOpens;
    impl OpenSocket for AlwaysOpens {
        fn open(&self, _host: &str, _port: u16, _timeout: Option<Duration>) -> Result<Box<dyn Transport>, ClusterError> {
            Ok(Box::new(NullTransport))
        }
    }

    struct NeverOpens;
    impl OpenSocket for NeverOpens {
        fn open(&self, _host: &str, _port: u16, _timeout: Option<Duration>) -> Result<Box<dyn Transport>, ClusterError> {
            Err(ClusterError::from((ErrorKind::NoNode, "dial refused")))
        }
    }

    struct StubRefresher(StdMutex<ShardMap>);
    impl TopologyRefresher for StubRefresher {
        fn refresh_shard_map(&self, _via: &NodeConnection) -> Result<ShardMap, ClusterError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn one_master_map() -> ShardMap {
        let master = Node::new(b"m1".to_vec(), Role::Master, "127.0.0.1", 7000);
        let shard = Arc::new(Shard::new(master, vec![]));
        let mut map = ShardMap::new();
        map.assign_range(0, 16383, shard);
        map
    }

    #[test]
    fn connect_opens_one_connection_per_node() {
        let map = one_master_map();
        let conn = Connection::connect(
            Arc::new(AlwaysOpens),
            Arc::new(CommandInfoTable::default()),
            map,
            Arc::new(StubRefresher(StdMutex::new(ShardMap::new()))),
            Config::default(),
        )
        .unwrap();
        assert_eq!(conn.inner.node_conns.read().unwrap().len(), 1);
    }

    #[test]
    fn connect_fails_with_no_node_when_every_dial_fails() {
        let map = one_master_map();
        let err = Connection::connect(
            Arc::new(NeverOpens),
            Arc::new(CommandInfoTable::default()),
            map,
            Arc::new(StubRefresher(StdMutex::new(ShardMap::new()))),
            Config::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoNode);
    }

    #[test]
    fn nodes_lists_master_and_replicas_once_each() {
        let master = Node::new(b"m1".to_vec(), Role::Master, "127.0.0.1", 7000);
        let replica = Node::new(b"r1".to_vec(), Role::Replica, "127.0.0.1", 7001);
        let shard = Arc::new(Shard::new(master, vec![replica]));
        let mut map = ShardMap::new();
        map.assign_range(0, 16383, shard);
        assert_eq!(nodes(&map).len(), 2);
    }
}
