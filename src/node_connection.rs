//! C4: per-node transport and self-healing request/reply plumbing.
//!
//! Grounded on `cluster.rs`'s per-node `ClusterConnection` handling — it
//! keeps one connection per node and lazily reconnects on the next use
//! after a connection is found dead, rather than eagerly after every error.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{lock_or_diagnose, ClusterError, ErrorKind};
use crate::node::Node;
use crate::resp::{decode_reply, encode_request, Reply, Request};

/// A byte-level duplex stream to one node. Out of scope to implement here
/// (spec §1) — callers supply a real TCP/TLS stream.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClusterError>;
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ClusterError>;
}

/// Dials a fresh `Transport` to `host:port`, bounded by `timeout` (spec
/// §6's `open_socket: (host, port, timeout) -> Transport`).
pub trait OpenSocket: Send + Sync {
    fn open(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<Box<dyn Transport>, ClusterError>;
}

/// `MULTI <key> ...` and `EXEC <key> ...` carry an extra routing-pin token
/// that only the router needed; the wire only ever sees the bare command
/// name. Idempotent: cleaning an already-clean request is a no-op.
pub fn clean_request(request: &Request) -> Request {
    match request.name_lowercase().as_deref() {
        Some("multi") => Request::from_strs(["MULTI"]),
        Some("exec") => Request::from_strs(["EXEC"]),
        _ => request.clone(),
    }
}

/// One node's live connection plus its read-side carry-over buffer.
///
/// Reconnection is self-healing but narrow: only a transport that closed
/// mid-frame (`ErrorKind::ConnectionClosed`) is worth silently replacing —
/// a `NoNode` dial failure or a timeout is surfaced to the caller as-is
/// (spec §4.6's literal wording), since retrying those here would hide a
/// real outage behind an extra, unbounded reconnect loop.
pub struct NodeConnection {
    node: Node,
    opener: std::sync::Arc<dyn OpenSocket>,
    dial_timeout: Option<Duration>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    read_buf: Mutex<Vec<u8>>,
}

impl NodeConnection {
    pub fn new(node: Node, opener: std::sync::Arc<dyn OpenSocket>, dial_timeout: Option<Duration>) -> Result<Self, ClusterError> {
        let transport = opener.open(&node.host, node.port, dial_timeout)?;
        Ok(NodeConnection {
            node,
            opener,
            dial_timeout,
            transport: Mutex::new(Some(transport)),
            read_buf: Mutex::new(Vec::new()),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Writes every (cleaned) request in order, then reads back exactly
    /// `requests.len()` reply frames in order (spec §4.6). Reconnects once,
    /// transparently, if the transport was already dead from a previous call.
    pub fn request_node(&self, requests: &[Request], deadline: Duration) -> Result<Vec<Reply>, ClusterError> {
        match self.try_request_node(requests, deadline) {
            Err(err) if err.kind() == ErrorKind::ConnectionClosed => {
                self.reconnect()?;
                self.try_request_node(requests, deadline)
            }
            other => other,
        }
    }

    fn reconnect(&self) -> Result<(), ClusterError> {
        let fresh = self.opener.open(&self.node.host, self.node.port, self.dial_timeout)?;
        let mut guard = lock_or_diagnose(&self.transport, "NodeConnection::transport");
        *guard = Some(fresh);
        lock_or_diagnose(&self.read_buf, "NodeConnection::read_buf").clear();
        Ok(())
    }

    fn try_request_node(&self, requests: &[Request], deadline: Duration) -> Result<Vec<Reply>, ClusterError> {
        let started = Instant::now();
        let mut transport_guard = lock_or_diagnose(&self.transport, "NodeConnection::transport");
        let transport = transport_guard
            .as_mut()
            .ok_or_else(|| ClusterError::from((ErrorKind::ConnectionClosed, "transport previously torn down")))?;

        for request in requests {
            transport.write_all(&encode_request(&clean_request(request)))?;
        }

        let mut buf_guard = lock_or_diagnose(&self.read_buf, "NodeConnection::read_buf");
        let mut replies = Vec::with_capacity(requests.len());
        while replies.len() < requests.len() {
            if let Some((reply, consumed)) = decode_reply(&buf_guard)? {
                buf_guard.drain(..consumed);
                replies.push(reply);
                continue;
            }
            if started.elapsed() >= deadline {
                return Err(ClusterError::from((ErrorKind::NoNode, "node request exceeded its deadline")));
            }
            let mut chunk = [0u8; 4096];
            let n = transport.read_some(&mut chunk)?;
            if n == 0 {
                *transport_guard = None;
                return Err(ClusterError::from((ErrorKind::ConnectionClosed, "transport returned EOF")));
            }
            buf_guard.extend_from_slice(&chunk[..n]);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct ScriptedTransport {
        inbound: VecDeque<u8>,
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), ClusterError> {
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ClusterError> {
            if self.inbound.is_empty() {
                return Ok(0);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    struct ScriptedOpener {
        replies: Mutex<VecDeque<Vec<u8>>>,
    }

    impl OpenSocket for ScriptedOpener {
        fn open(&self, _host: &str, _port: u16, _timeout: Option<Duration>) -> Result<Box<dyn Transport>, ClusterError> {
            let payload = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedTransport {
                inbound: payload.into_iter().collect(),
            }))
        }
    }

    #[test]
    fn request_node_round_trips_a_batch_in_order() {
        let opener = Arc::new(ScriptedOpener {
            replies: Mutex::new(VecDeque::from([b"+OK\r\n:1\r\n".to_vec()])),
        });
        let node = Node::new(b"n1".to_vec(), Role::Master, "127.0.0.1", 6379);
        let conn = NodeConnection::new(node, opener, None).unwrap();
        let requests = vec![Request::from_strs(["SET", "a", "1"]), Request::from_strs(["INCR", "c"])];
        let replies = conn.request_node(&requests, Duration::from_secs(1)).unwrap();
        assert_eq!(replies, vec![Reply::SimpleString("OK".to_string()), Reply::Integer(1)]);
    }

    #[test]
    fn dead_transport_triggers_one_reconnect() {
        let opener = Arc::new(ScriptedOpener {
            replies: Mutex::new(VecDeque::from([Vec::new(), b"+OK\r\n".to_vec()])),
        });
        let node = Node::new(b"n1".to_vec(), Role::Master, "127.0.0.1", 6379);
        let conn = NodeConnection::new(node, opener, None).unwrap();
        let replies = conn
            .request_node(&[Request::from_strs(["PING"])], Duration::from_secs(1))
            .unwrap();
        assert_eq!(replies, vec![Reply::SimpleString("OK".to_string())]);
    }

    #[test]
    fn clean_request_strips_multi_exec_pin_and_is_idempotent() {
        let request = Request::from_strs(["MULTI", "a"]);
        let cleaned = clean_request(&request);
        assert_eq!(cleaned, Request::from_strs(["MULTI"]));
        assert_eq!(clean_request(&cleaned), cleaned);
    }
}
