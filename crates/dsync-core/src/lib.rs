//! DSync Core - Snapshot, Diff and Apply
//!
//! This crate provides the replica-local half of diagram synchronisation:
//! - Canonical element snapshots and bounded state history
//! - Typed diffs between snapshots, dependency-sorted for replay
//! - Applying diffs through a diagram model's mutation primitives, with rollback
//! - Cancellable scheduled tasks for debounce and retry timers

pub mod apply;
pub mod calculate;
pub mod diff;
pub mod element;
pub mod error;
pub mod extract;
pub mod model;
pub mod state;
pub mod task;

pub use apply::{ApplicatorConfig, DiffApplicator, SyncResult};
pub use calculate::{dependency_order, CalculatorConfig, DiffCalculator};
pub use diff::{Change, ChangeKind, DiffPriority, DiffStatistics, DocumentDiff, ModifiedElement};
pub use element::{ElementData, ElementId, ElementKind, Point, PropertyMap, PropertyPatch, Size};
pub use error::{Error, ErrorCode, ModelError, ModelResult, Operation, OperationError, Result, SyncWarning};
pub use extract::{ExtractorConfig, StateExtractor};
pub use model::{ChangeAction, ChangeListener, ConnectionSpec, DiagramModel, MemoryModel, ModelElement, ModelEvent, ShapeSpec};
pub use state::{DocumentState, StateManager};
pub use task::Scheduler;
