//! DSync Transport Layer
//!
//! Moves diffs between replicas through a shared collaborative map:
//! - SharedMap: the eventually-consistent map abstraction
//! - YrsSharedMap: a yrs document implementing it, plus an in-process relay
//! - TransportAdapter: origin-tagged sending, batching, retries and dedup

pub mod adapter;
pub mod error;
pub mod shared_map;
pub mod yrs_map;

pub use adapter::{AdapterConfig, TransportAdapter, TransportStats};
pub use error::{TransportError, TransportResult};
pub use shared_map::{ConnectionState, MapAction, MapCallback, MapEvent, MapOp, MapSubscription, SharedMap};
pub use yrs_map::{MemoryRelay, YrsSharedMap, RELAY_ORIGIN};
