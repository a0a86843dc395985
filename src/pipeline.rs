//! C6: the pipeline engine — buffering, flushing, per-node batching, and
//! redirection handling.
//!
//! The deferred-reply mechanism itself has no direct analog in the teacher
//! crate (whose `cluster.rs` dispatches eagerly); it is designed fresh per
//! the lazy-replies design note, while the per-node batching/retry-on-
//! alternate-node algorithm in `evaluate` is grounded on `cluster.rs`'s
//! `execute_on_multiple_nodes`/`request` retry loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command_info::CommandInfoProvider;
use crate::error::{lock_or_diagnose, ClusterError, ErrorKind};
use crate::node::Node;
use crate::node_connection::NodeConnection;
use crate::resp::{Reply, Request};
use crate::router;
use crate::shard_map::ShardMap;

/// Everything `evaluate` needs from the owning `Connection`, kept as a
/// trait so the pipeline engine can be built and tested without pulling in
/// the full connection-lifecycle machinery (spec §4.7).
pub trait PipelineContext: Send + Sync {
    fn shard_map(&self) -> Arc<ShardMap>;
    fn command_info(&self) -> &dyn CommandInfoProvider;
    fn read_only(&self) -> bool;
    fn node_request_deadline(&self) -> Duration;
    /// Strict lookup, used only where a node is guaranteed already
    /// connected from `connect()` time (e.g. `request_master_nodes`'s
    /// fan-out) — the dispatch/retry paths below use
    /// `ensure_node_connection` instead, since they can name a node the
    /// table hasn't dialed yet.
    fn node_connection(&self, node: &Node) -> Option<Arc<NodeConnection>>;
    /// Any connection other than `exclude` — the "different, arbitrary"
    /// node a failed group is retried against (spec §4.5 step 3): the
    /// first entry that isn't `exclude`, or none if `exclude` is the only
    /// connection in the table.
    fn alternate_node_connection(&self, exclude: &Node) -> Option<Arc<NodeConnection>>;
    /// Returns the connection for `node`, dialing one lazily through the
    /// `OpenSocket` collaborator and adding it to the table if it isn't
    /// there yet. The redirect retry pass can name a node the table never
    /// saw at `connect` time (a freshly promoted replica after a MOVED, or
    /// an ASK target) — a topology refresh alone does not expand the
    /// table, so without this the redirected request could never actually
    /// be served.
    fn ensure_node_connection(&self, node: &Node) -> Result<Arc<NodeConnection>, ClusterError>;
    /// Replaces the shared ShardMap cell with a freshly fetched snapshot.
    fn refresh_shard_map(&self) -> Result<(), ClusterError>;
}

/// True when `reply`'s error payload is classified as `MOVED` by its
/// leading whitespace-delimited token alone — spec §4.5: "Payload details
/// are ignored — a full shard-map refresh is the response," independent of
/// whether the rest of the payload parses as a well-formed `host:port`.
fn is_moved(reply: &Reply) -> bool {
    matches!(reply.error_token(), Some(b"MOVED"))
}

struct AskTarget {
    host: String,
    port: u16,
}

/// Parses `ASK <slot> <host>:<port>`; anything else — including a
/// malformed `host:port` — is "not a redirection" and returned as `None`
/// (spec §4.5's ASK parsing note: malformed forms propagate unchanged).
fn parse_ask(reply: &Reply) -> Option<AskTarget> {
    let payload = match reply {
        Reply::Error(payload) => payload,
        _ => return None,
    };
    let mut tokens = payload.split(|&b| b == b' ').filter(|t| !t.is_empty());
    if tokens.next()? != b"ASK" {
        return None;
    }
    let _slot = tokens.next()?;
    let addr = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    let addr = std::str::from_utf8(addr).ok()?;
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(AskTarget {
        host: host.to_string(),
        port,
    })
}

/// C6 data model: `Pending` requests in submission order, or a finalized,
/// stable `Executed` outcome. `Executed` wraps a `Result` (rather than a
/// bare reply vector) so a routing/fail-fast error during evaluation still
/// yields a stable terminal state instead of leaving the generation in a
/// corrupted or ambiguous condition (spec §8 invariant 3).
pub enum PipelineState {
    Pending(Vec<Request>),
    Executed(Arc<Result<Vec<Reply>, ClusterError>>),
}

/// One pipeline generation: a mutable cell holding one `PipelineState`.
pub struct Pipeline {
    state: Mutex<PipelineState>,
}

impl Pipeline {
    fn pending(requests: Vec<Request>) -> Self {
        Pipeline {
            state: Mutex::new(PipelineState::Pending(requests)),
        }
    }

    pub fn fresh() -> Self {
        Pipeline::pending(Vec::new())
    }
}

/// A handle to one submission's eventual reply. Safe to force from any
/// thread; forcing is idempotent — the first `force()` to observe a
/// `Pending` state runs `evaluate` under the pipeline's lock and the state
/// afterwards is `Executed` for every other handle sharing this generation
/// (spec §4.5, §8 invariant 3).
pub struct DeferredReply {
    pipeline: Arc<Pipeline>,
    index: usize,
    context: Arc<dyn PipelineContext>,
}

impl DeferredReply {
    pub fn force(&self) -> Result<Reply, ClusterError> {
        let mut guard = lock_or_diagnose(&self.pipeline.state, "Pipeline::state");
        let outcome = match &*guard {
            PipelineState::Executed(outcome) => Arc::clone(outcome),
            PipelineState::Pending(_) => {
                let requests = match std::mem::replace(&mut *guard, PipelineState::Pending(Vec::new())) {
                    PipelineState::Pending(requests) => requests,
                    PipelineState::Executed(_) => unreachable!("checked above"),
                };
                let outcome = Arc::new(evaluate(self.context.as_ref(), requests));
                *guard = PipelineState::Executed(Arc::clone(&outcome));
                outcome
            }
        };
        drop(guard);
        match &*outcome {
            Ok(replies) => replies
                .get(self.index)
                .cloned()
                .ok_or_else(|| ClusterError::from((ErrorKind::Other, "deferred reply index out of bounds"))),
            Err(err) => Err(err.clone()),
        }
    }
}

/// Submission path (spec §4.5). `pipeline_cell` is the Connection's outer
/// cell; it is held only long enough to read the current generation, push
/// onto it or rotate to a fresh one, and (if this submission reached the
/// flush threshold) hand off to `force`, which performs the actual
/// evaluation under the generation's own lock.
pub fn request_pipelined(
    context: Arc<dyn PipelineContext>,
    pipeline_cell: &Mutex<Arc<Pipeline>>,
    request: Request,
    flush_threshold: usize,
) -> DeferredReply {
    let mut outer = lock_or_diagnose(pipeline_cell, "Connection::pipeline_cell");
    let current = Arc::clone(&outer);

    let (pipeline, index, flush_now) = {
        let mut inner = lock_or_diagnose(&current.state, "Pipeline::state");
        if matches!(&*inner, PipelineState::Executed(_)) {
            let fresh = Arc::new(Pipeline::pending(vec![request]));
            *outer = Arc::clone(&fresh);
            (fresh, 0, false)
        } else {
            match &mut *inner {
                PipelineState::Pending(requests) => {
                    let index = requests.len();
                    requests.push(request);
                    let flush_now = index >= flush_threshold;
                    (Arc::clone(&current), index, flush_now)
                }
                PipelineState::Executed(_) => unreachable!("checked above"),
            }
        }
    };
    drop(outer);

    let deferred = DeferredReply {
        pipeline,
        index,
        context,
    };
    if flush_now {
        let _ = deferred.force();
    }
    deferred
}

/// Evaluation (spec §4.5 steps 1–7).
pub fn evaluate(context: &dyn PipelineContext, requests: Vec<Request>) -> Result<Vec<Reply>, ClusterError> {
    let shard_map = context.shard_map();
    let provider = context.command_info();

    // Steps 1–2: route every request and group by destination node,
    // preserving each group's relative submission order.
    let mut group_order: Vec<Node> = Vec::new();
    let mut groups: HashMap<Node, Vec<(usize, Request)>> = HashMap::new();
    for (index, request) in requests.into_iter().enumerate() {
        let node = router::route_to_node(&shard_map, provider, &request, context.read_only())?;
        groups
            .entry(node.clone())
            .or_insert_with(|| {
                group_order.push(node.clone());
                Vec::new()
            })
            .push((index, request));
    }

    // Step 3: dispatch each group, with one whole-group retry against an
    // alternate node on I/O failure.
    let mut completed: Vec<(usize, Request, Reply)> = Vec::new();
    for node in group_order {
        let group = groups.remove(&node).expect("group_order only lists nodes present in `groups`");
        let indices: Vec<usize> = group.iter().map(|(index, _)| *index).collect();
        let group_requests: Vec<Request> = group.into_iter().map(|(_, request)| request).collect();
        let replies = dispatch_group_with_retry(context, &node, &group_requests)?;
        for ((index, request), reply) in indices.into_iter().zip(group_requests.iter().cloned()).zip(replies) {
            completed.push((index, request, reply));
        }
    }

    // Step 5: moved-pass. A single refresh covers every MOVED in this pass.
    let any_moved = completed.iter().any(|(_, _, reply)| is_moved(reply));
    if any_moved {
        context.refresh_shard_map()?;
    }

    // Step 6: retry-pass.
    let mut finished: Vec<(usize, Reply)> = Vec::with_capacity(completed.len());
    for (index, request, reply) in completed {
        let resolved = retry(context, &request, reply, 0)?;
        finished.push((index, resolved));
    }

    // Step 7.
    finished.sort_by_key(|(index, _)| *index);
    Ok(finished.into_iter().map(|(_, reply)| reply).collect())
}

fn retry(context: &dyn PipelineContext, request: &Request, reply: Reply, retry_count: u32) -> Result<Reply, ClusterError> {
    if is_moved(&reply) {
        let shard_map = context.shard_map();
        let node = router::route_to_node(&shard_map, context.command_info(), request, context.read_only())?;
        return dispatch_single(context, &node, request);
    }
    match parse_ask(&reply) {
        Some(AskTarget { host, port }) => match node_connection_at(context, &host, port)? {
            Some(nc) => {
                let mut replies =
                    nc.request_node(&[Request::from_strs(["ASKING"]), request.clone()], context.node_request_deadline())?;
                Ok(replies.remove(1))
            }
            None if retry_count == 0 => {
                context.refresh_shard_map()?;
                retry(context, request, reply, retry_count + 1)
            }
            None => Err(ClusterError::from((ErrorKind::MissingNode, "ASK target not found after refresh"))),
        },
        None => Ok(reply),
    }
}

/// `None` means the host/port isn't present in the current ShardMap at
/// all (the caller's signal to refresh and retry once); a node that *is*
/// present but not yet connected is dialed lazily via `ensure_node_connection`.
fn node_connection_at(context: &dyn PipelineContext, host: &str, port: u16) -> Result<Option<Arc<NodeConnection>>, ClusterError> {
    match context.shard_map().node_with_host_port(host, port) {
        Some(node) => context.ensure_node_connection(&node).map(Some),
        None => Ok(None),
    }
}

fn dispatch_group_with_retry(context: &dyn PipelineContext, node: &Node, requests: &[Request]) -> Result<Vec<Reply>, ClusterError> {
    let nc = context.ensure_node_connection(node)?;
    match nc.request_node(requests, context.node_request_deadline()) {
        Ok(replies) => Ok(replies),
        Err(_) => {
            let alt = context
                .alternate_node_connection(node)
                .ok_or_else(|| ClusterError::from((ErrorKind::NoNode, "no alternate node connection available")))?;
            alt.request_node(requests, context.node_request_deadline())
                .map_err(|_| ClusterError::from((ErrorKind::NoNode, "alternate node dispatch also failed")))
        }
    }
}

fn dispatch_single(context: &dyn PipelineContext, node: &Node, request: &Request) -> Result<Reply, ClusterError> {
    let nc = context.ensure_node_connection(node)?;
    let mut replies = nc.request_node(std::slice::from_ref(request), context.node_request_deadline())?;
    Ok(replies.remove(0))
}
