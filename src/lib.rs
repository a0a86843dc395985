//! Core routing and implicit-pipelining layer for a sharded, replicated
//! RESP key-value store client.
//!
//! This crate solves three problems: request routing by hash slot,
//! cross-node implicit pipelining with lazily realized replies, and
//! topology-change recovery via `MOVED`/`ASK` redirection. Socket
//! management, RESP frame decoding of a live stream, authentication, and
//! shard-map discovery are external collaborators — see [`node_connection`]
//! and [`topology`] for the traits a caller implements.

pub mod command_info;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod node_connection;
pub mod pipeline;
pub mod resp;
pub mod router;
pub mod shard_map;
pub mod slot;
pub mod topology;

pub use command_info::{CommandInfo, CommandInfoProvider, CommandInfoTable};
pub use config::Config;
pub use connection::{nodes, Connection};
pub use error::{ClusterError, ErrorKind};
pub use node::{Node, Role, Shard};
pub use node_connection::{clean_request, NodeConnection, OpenSocket, Transport};
pub use pipeline::{DeferredReply, Pipeline, PipelineContext, PipelineState};
pub use resp::{Reply, Request};
pub use router::{pick_node, route, route_to_node};
pub use shard_map::ShardMap;
pub use slot::{key_to_slot, SLOT_COUNT};
pub use topology::TopologyRefresher;
