//! Crate-wide error type.
//!
//! Shaped the way the teacher crate shapes its own error: an [`ErrorKind`]
//! classifying *why*, paired with a static description and an optional
//! owned detail string, constructed via `From<(ErrorKind, &str[, String])>`
//! tuples at call sites (see `cluster.rs`'s repeated
//! `RedisError::from((ErrorKind::X, "..."))`).

use std::fmt;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// See spec §7 for the authoritative description of when each kind is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command name is absent from the command-info registry and no
    /// MULTI/EXEC override applies.
    UnsupportedCommand,
    /// A single request's keys hash to more than one shard.
    CrossSlot,
    /// Routing resolved to no known node, or an ASK target could not be
    /// located even after one topology refresh.
    MissingNode,
    /// No node connection could be established at all, or a per-node I/O
    /// call exceeded its deadline.
    NoNode,
    /// The frame parser reported a malformed frame or EOF mid-frame.
    ConnectionClosed,
    /// A collaborator (`Transport`, `OpenSocket`, `TopologyRefresher`)
    /// raised something outside the kinds above.
    Other,
}

/// A raised cluster-core error. `ServerError` (spec §7) is deliberately
/// *not* a variant here — it is carried as a `Reply::Error` value, never
/// raised, per spec's explicit "delivered as the Reply value itself."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterError {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{:?}: {} ({})", self.kind, self.description, detail),
            None => write!(f, "{:?}: {}", self.kind, self.description),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<(ErrorKind, &'static str)> for ClusterError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        ClusterError {
            kind,
            description,
            detail: None,
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for ClusterError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        ClusterError {
            kind,
            description,
            detail: Some(detail),
        }
    }
}

/// `std::sync::Mutex` cannot report "the holder is dead and this acquire
/// will block forever" the way the source's runtime could — poisoning
/// (a panic while holding the lock) is the nearest observable proxy. These
/// helpers stand in for spec §5/§7's dead-lock diagnostic: name the lock
/// site, log it, and recover the guard rather than panicking again.
pub fn lock_or_diagnose<'a, T>(mutex: &'a Mutex<T>, lock_site: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(lock_site, "lock holder panicked; recovering poisoned state");
        poisoned.into_inner()
    })
}

pub fn read_or_diagnose<'a, T>(lock: &'a RwLock<T>, lock_site: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(lock_site, "lock holder panicked; recovering poisoned state");
        poisoned.into_inner()
    })
}

pub fn write_or_diagnose<'a, T>(lock: &'a RwLock<T>, lock_site: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(lock_site, "lock holder panicked; recovering poisoned state");
        poisoned.into_inner()
    })
}
