//! The shared collaborative map the adapter writes diffs into
//!
//! Any eventually-consistent string map with origin-tagged transactions and
//! change observation can back the transport; [`crate::YrsSharedMap`] is the
//! provided implementation.

use crate::error::TransportResult;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapAction {
    Add,
    Update,
    Delete,
}

/// One key change, tagged with the origin of the transaction that made it
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent {
    pub key: String,
    pub action: MapAction,
    pub origin: Option<String>,
    /// New value for adds and updates
    pub value: Option<String>,
}

/// A write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum MapOp {
    Set(String, String),
    Delete(String),
}

/// Connectivity of the underlying replication channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Observer callback; receives every key change of one transaction.
/// Runs inside the committing transaction, so it must not read the map.
pub type MapCallback = Arc<dyn Fn(&[MapEvent]) + Send + Sync>;

/// Keeps an observer registered; dropping it unsubscribes
pub struct MapSubscription {
    _inner: Box<dyn Any + Send + Sync>,
}

impl MapSubscription {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self { _inner: Box::new(inner) }
    }
}

impl std::fmt::Debug for MapSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MapSubscription")
    }
}

/// Eventually-consistent shared string map
pub trait SharedMap: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn keys(&self) -> Vec<String>;

    /// Apply `ops` atomically, tagging the transaction with `origin`
    fn transact(&self, origin: &str, ops: Vec<MapOp>) -> TransportResult<()>;

    fn observe(&self, callback: MapCallback) -> MapSubscription;

    /// Connection-state transitions, pushed as they happen
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Every `(key, value)` whose key starts with `prefix`
    fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter_map(|k| self.get(&k).map(|v| (k, v)))
            .collect()
    }
}
