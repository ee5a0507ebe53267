//! Engine events and the plugin hook

use crate::config::SyncOptions;
use crate::error::EngineResult;
use dsync_core::{DocumentDiff, Operation, OperationError, SyncResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which engine events a handler subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineEventKind {
    LocalSync,
    RemoteSync,
    SyncError,
}

/// Something the engine did
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local diff was computed and handed to the transport
    LocalSync {
        diff: Arc<DocumentDiff>,
        result: SyncResult,
    },
    /// A remote diff (or a deferred retry of one) was applied
    RemoteSync {
        diff_id: Option<String>,
        from_client: Option<String>,
        result: SyncResult,
    },
    /// A tick or an apply failed; the engine keeps running
    SyncError {
        operation: Operation,
        errors: Vec<OperationError>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EngineEventKind {
        match self {
            EngineEvent::LocalSync { .. } => EngineEventKind::LocalSync,
            EngineEvent::RemoteSync { .. } => EngineEventKind::RemoteSync,
            EngineEvent::SyncError { .. } => EngineEventKind::SyncError,
        }
    }

    /// The sync result carried by this event, if any
    pub fn result(&self) -> Option<&SyncResult> {
        match self {
            EngineEvent::LocalSync { result, .. } | EngineEvent::RemoteSync { result, .. } => Some(result),
            EngineEvent::SyncError { .. } => None,
        }
    }
}

/// Engine event callback
pub type EngineEventHandler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// What a plugin learns about the engine it joins
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub client_id: String,
    pub options: SyncOptions,
}

/// Cross-cutting concern attached to an engine by name
pub trait SyncPlugin: Send {
    fn name(&self) -> &str;

    /// Called once when the plugin is registered
    fn initialize(&mut self, _ctx: &PluginContext) -> EngineResult<()> {
        Ok(())
    }

    /// Every event the engine emits, after the subscribed handlers
    fn on_event(&mut self, event: &EngineEvent);

    /// Called once when the engine is destroyed
    fn destroy(&mut self) {}
}
