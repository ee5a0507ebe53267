//! DSync Engine - per-replica synchronisation
//!
//! Ties the core diff pipeline to a transport:
//! - Event ingestion: dedup, debounce and consolidation of model notifications
//! - SyncEngine: periodic local sync and immediate remote-diff application
//! - EngineHandle: the engine running as one serial tokio task
//! - Plugins, including a Prometheus metrics plugin (`metrics` feature)
//!
//! # Example
//!
//! ```rust,no_run
//! use dsync_core::MemoryModel;
//! use dsync_engine::{SyncEngine, SyncOptions};
//! use dsync_transport::YrsSharedMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> dsync_engine::EngineResult<()> {
//! let map = YrsSharedMap::new("replica-a");
//! let engine = SyncEngine::initialize(MemoryModel::new(), Arc::new(map), SyncOptions::new("replica-a"))?;
//! let handle = engine.start();
//! let result = handle.sync().await?;
//! assert!(result.success);
//! handle.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod plugin;

pub use config::{EventConfig, SyncOptions};
pub use engine::{EngineMetrics, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use events::{consolidate, EventDeduplicator, EventHandler, EventStats, HandlerError, UnifiedEventManager};
pub use handle::EngineHandle;
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsPlugin, MetricsServer};
pub use plugin::{EngineEvent, EngineEventHandler, EngineEventKind, PluginContext, SyncPlugin};
