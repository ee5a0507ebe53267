//! Engine options

use crate::error::{EngineError, EngineResult};
use dsync_core::{ApplicatorConfig, CalculatorConfig, ExtractorConfig};
use dsync_protocol::DEFAULT_COMPRESSION_THRESHOLD;
use dsync_transport::AdapterConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every knob of one replica's engine.
///
/// Deserialises from kebab-case keys with defaults for anything missing,
/// so a TOML `[engine]` table only names what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SyncOptions {
    pub client_id: String,
    pub sync_interval_ms: u64,
    pub position_tolerance: f64,
    pub batch_threshold: usize,
    /// Retries for connections whose endpoints are not yet present
    pub max_retries: u32,
    pub enable_optimization: bool,
    pub ignore_minor_changes: bool,
    pub max_history_size: usize,

    pub apply_batch_size: usize,
    pub retry_delay_ms: u64,
    pub rollback_on_error: bool,

    pub event_batching: bool,
    pub event_debounce_ms: u64,
    pub dedup_window_ms: u64,
    pub dedup_capacity: usize,

    pub transport_batching: bool,
    pub transport_batch_window_ms: u64,
    pub transport_max_retries: u32,
    pub transport_backoff_ms: u64,
    pub compression_threshold: usize,
    pub max_retained_diffs: usize,

    /// Rebuild from the shared map on initialize
    pub catch_up: bool,
    pub element_registry: bool,

    pub extractor: ExtractorConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            sync_interval_ms: 500,
            position_tolerance: 0.5,
            batch_threshold: 10,
            max_retries: 1,
            enable_optimization: true,
            ignore_minor_changes: true,
            max_history_size: 100,
            apply_batch_size: 50,
            retry_delay_ms: 500,
            rollback_on_error: true,
            event_batching: true,
            event_debounce_ms: 50,
            dedup_window_ms: 1000,
            dedup_capacity: 20,
            transport_batching: true,
            transport_batch_window_ms: 100,
            transport_max_retries: 3,
            transport_backoff_ms: 50,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_retained_diffs: 64,
            catch_up: true,
            element_registry: true,
            extractor: ExtractorConfig::default(),
        }
    }
}

impl SyncOptions {
    /// Defaults for `client_id`
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidOptions(msg.to_string()));

        if self.client_id.trim().is_empty() {
            return invalid("client-id must not be empty");
        }
        if self.sync_interval_ms == 0 {
            return invalid("sync-interval-ms must be greater than zero");
        }
        if !self.position_tolerance.is_finite() || self.position_tolerance < 0.0 {
            return invalid("position-tolerance must be a non-negative number");
        }
        if self.apply_batch_size == 0 {
            return invalid("apply-batch-size must be greater than zero");
        }
        if self.batch_threshold == 0 {
            return invalid("batch-threshold must be greater than zero");
        }
        if self.max_history_size == 0 {
            return invalid("max-history-size must be greater than zero");
        }
        if self.dedup_capacity == 0 {
            return invalid("dedup-capacity must be greater than zero");
        }
        if self.max_retained_diffs == 0 {
            return invalid("max-retained-diffs must be greater than zero");
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn calculator(&self) -> CalculatorConfig {
        CalculatorConfig {
            position_tolerance: self.position_tolerance,
            ignore_minor_changes: self.ignore_minor_changes,
            batch_threshold: self.batch_threshold,
            enable_optimization: self.enable_optimization,
            ..Default::default()
        }
    }

    pub fn applicator(&self) -> ApplicatorConfig {
        ApplicatorConfig {
            batch_size: self.apply_batch_size,
            rollback_on_error: self.rollback_on_error,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn adapter(&self) -> AdapterConfig {
        AdapterConfig {
            batching: self.transport_batching,
            batch_window: Duration::from_millis(self.transport_batch_window_ms),
            max_retries: self.transport_max_retries,
            backoff: Duration::from_millis(self.transport_backoff_ms),
            compression_threshold: self.compression_threshold,
            max_retained_diffs: self.max_retained_diffs,
            element_registry: self.element_registry,
            ..AdapterConfig::new(self.client_id.clone())
        }
    }

    pub fn events(&self) -> EventConfig {
        EventConfig {
            batching: self.event_batching,
            debounce: Duration::from_millis(self.event_debounce_ms),
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            dedup_capacity: self.dedup_capacity,
        }
    }
}

/// Event ingestion settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventConfig {
    /// Buffer events and dispatch consolidated survivors after `debounce`
    pub batching: bool,
    pub debounce: Duration,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        SyncOptions::default().events()
    }
}
