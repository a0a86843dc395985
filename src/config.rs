//! Config recognized by the core (spec §6).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Replica-preference for read-only commands.
    pub read_only: bool,
    /// Per-socket-op deadline passed through to `OpenSocket::open` on
    /// every dial (spec §6's `open_socket: (host, port, timeout) ->
    /// Transport`). `None` means the collaborator picks its own default.
    pub timeout: Option<Duration>,
    /// Per-socket-op deadline for a single `request_node` call.
    ///
    /// The source this was distilled from labels this "100 ms" in a
    /// comment but codes it as ~1 s; the coded value is authoritative here.
    pub node_request_deadline: Duration,
    /// Submission count at which a Pending pipeline flushes inline instead
    /// of waiting for a `force()`.
    pub pipeline_flush_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_only: false,
            timeout: None,
            node_request_deadline: Duration::from_millis(1000),
            pipeline_flush_threshold: 1000,
        }
    }
}
