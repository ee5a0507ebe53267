//! The per-replica sync engine
//!
//! One engine owns one diagram model. Local changes are extracted, diffed
//! against the last recorded snapshot and handed to the transport; remote
//! diffs are reconciled against the shared element registry and applied
//! immediately, after which the model is re-extracted so the next local diff
//! starts from the merged state.

use crate::config::SyncOptions;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventStats, UnifiedEventManager};
use crate::plugin::{EngineEvent, EngineEventHandler, EngineEventKind, PluginContext, SyncPlugin};
use dsync_core::{
    dependency_order, CalculatorConfig, DiagramModel, ErrorCode, DiffApplicator, DiffCalculator, DocumentDiff, DocumentState,
    ElementId, ModelEvent, ModifiedElement, Operation, OperationError, StateExtractor, StateManager, SyncResult,
};
use dsync_transport::{ConnectionState, SharedMap, TransportAdapter, TransportStats};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Snapshot of an engine's counters and state
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMetrics {
    pub client_id: String,
    pub local_syncs: u64,
    pub remote_syncs: u64,
    pub sync_errors: u64,
    pub changes_sent: u64,
    pub changes_applied: u64,
    pub last_sync_ms: u64,
    pub average_sync_ms: f64,
    pub history_size: usize,
    pub state_version: u64,
    pub element_count: usize,
    /// Connections waiting for their endpoints
    pub pending_retries: usize,
    /// Diffs queued in the transport
    pub pending_sends: usize,
    pub paused: bool,
    pub connection: ConnectionState,
    pub events: EventStats,
    pub transport: TransportStats,
}

#[derive(Debug, Default)]
struct Counters {
    local_syncs: u64,
    remote_syncs: u64,
    sync_errors: u64,
    changes_sent: u64,
    changes_applied: u64,
    last_sync_ms: u64,
    total_sync_ms: u64,
}

/// Diff-based sync for one replica's diagram model
pub struct SyncEngine<M> {
    options: SyncOptions,
    model: M,
    extractor: StateExtractor,
    calculator: DiffCalculator,
    /// Exact comparisons for registry reconciliation
    reconciler: DiffCalculator,
    applicator: DiffApplicator,
    adapter: TransportAdapter,
    history: StateManager,
    events: UnifiedEventManager,
    /// Set while remote changes are written into the model
    suppress: Arc<AtomicBool>,
    handlers: Vec<(EngineEventKind, EngineEventHandler)>,
    plugins: Vec<Box<dyn SyncPlugin>>,
    counters: Counters,
    paused: bool,
    pub(crate) remote_rx: Option<mpsc::UnboundedReceiver<DocumentDiff>>,
    pub(crate) local_rx: Option<mpsc::UnboundedReceiver<ModelEvent>>,
}

impl<M: DiagramModel> SyncEngine<M> {
    /// Wire `model` to `map` and catch up with what the map already holds
    pub fn initialize(mut model: M, map: Arc<dyn SharedMap>, options: SyncOptions) -> EngineResult<Self> {
        options.validate()?;
        let client_id = options.client_id.clone();

        let adapter = TransportAdapter::new(map, options.adapter());
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        adapter.on_remote_diff(move |diff| {
            if remote_tx.send(diff).is_err() {
                trace!("Engine gone; dropping remote diff");
            }
        });
        adapter.start();

        let events = UnifiedEventManager::new(options.events());
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        events.on(move |event: &ModelEvent| {
            local_tx.send(event.clone()).map_err(|_| "engine stopped".into())
        });

        let suppress = Arc::new(AtomicBool::new(false));
        let listener_events = events.clone();
        let listener_suppress = suppress.clone();
        model.set_change_listener(Some(Arc::new(move |event: ModelEvent| {
            if listener_suppress.load(Ordering::SeqCst) {
                return;
            }
            listener_events.emit(event);
        })));

        let exact = CalculatorConfig {
            position_tolerance: 0.0,
            ignore_minor_changes: false,
            enable_optimization: false,
            ..options.calculator()
        };

        let mut engine = Self {
            extractor: StateExtractor::new(client_id.clone(), options.extractor.clone()),
            calculator: DiffCalculator::new(client_id.clone(), options.calculator()),
            reconciler: DiffCalculator::new(client_id.clone(), exact),
            applicator: DiffApplicator::new(client_id.clone(), options.applicator()),
            history: StateManager::new(options.max_history_size),
            adapter,
            events,
            suppress,
            model,
            handlers: Vec::new(),
            plugins: Vec::new(),
            counters: Counters::default(),
            paused: false,
            remote_rx: Some(remote_rx),
            local_rx: Some(local_rx),
            options,
        };

        let known = if engine.options.catch_up {
            Some(engine.catch_up())
        } else {
            None
        };
        let mut baseline = engine.extractor.extract(&engine.model);
        if let Some(known) = known {
            // Elements the shared map has never seen must still be sent
            baseline.elements.retain(|id, _| known.contains(id));
        }
        let baseline = engine.history.record(baseline);

        info!(
            client_id = %client_id,
            elements = baseline.len(),
            version = baseline.version,
            "Sync engine initialized"
        );
        Ok(engine)
    }

    /// Bring the model up to date with the shared map.
    ///
    /// Returns the ids the shared map already knows about.
    fn catch_up(&mut self) -> HashSet<ElementId> {
        let mut known = HashSet::new();

        if self.options.element_registry {
            let registry = self.adapter.registry();
            if registry.is_empty() {
                return known;
            }
            let local = self.extractor.extract(&self.model);
            let mut current = DocumentState::empty(self.options.client_id.clone());
            current.elements = local
                .elements
                .into_iter()
                .filter(|(id, _)| registry.contains_key(id))
                .collect();
            known.extend(registry.keys().cloned());
            let mut remote = DocumentState::empty(self.options.client_id.clone());
            remote.elements = registry;

            let diff = self.reconciler.calculate(Some(&current), &remote);
            let result = self.suppressed(|applicator, model| applicator.apply(&diff, model));
            info!(
                client_id = %self.options.client_id,
                applied = result.applied_changes,
                deferred = result.deferred,
                "Caught up from element registry"
            );
            self.report_failure(Operation::Receive, &result);
        } else {
            let diffs = self.adapter.retained_diffs();
            let mut applied = 0;
            for diff in &diffs {
                for el in &diff.added {
                    known.insert(el.id.clone());
                }
                for m in &diff.modified {
                    known.insert(m.id.clone());
                }
                for id in &diff.removed {
                    known.remove(id);
                }
                let result = self.suppressed(|applicator, model| applicator.apply(diff, model));
                applied += result.applied_changes;
                self.report_failure(Operation::Receive, &result);
            }
            self.adapter.remember(diffs.iter().map(|d| d.id.clone()));
            info!(
                client_id = %self.options.client_id,
                diffs = diffs.len(),
                applied,
                "Caught up from retained diffs"
            );
        }
        known
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutate the model as a local user would
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.model)
    }

    pub fn adapter(&self) -> &TransportAdapter {
        &self.adapter
    }

    pub fn events(&self) -> &UnifiedEventManager {
        &self.events
    }

    pub fn history(&self) -> &StateManager {
        &self.history
    }

    /// The last recorded snapshot
    pub fn state(&self) -> Option<Arc<DocumentState>> {
        self.history.latest()
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            info!(client_id = %self.options.client_id, "Sync paused");
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            info!(client_id = %self.options.client_id, "Sync resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn sync_interval(&self) -> Duration {
        self.options.sync_interval()
    }

    pub fn set_sync_interval(&mut self, interval: Duration) -> EngineResult<()> {
        let ms = interval.as_millis() as u64;
        if ms == 0 {
            return Err(EngineError::InvalidOptions("sync interval must be at least 1ms".into()));
        }
        self.options.sync_interval_ms = ms;
        debug!(client_id = %self.options.client_id, interval_ms = ms, "Sync interval changed");
        Ok(())
    }

    /// Subscribe to one kind of engine event
    pub fn on<F>(&mut self, kind: EngineEventKind, handler: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.handlers.push((kind, Arc::new(handler)));
    }

    pub(crate) fn on_shared(&mut self, kind: EngineEventKind, handler: EngineEventHandler) {
        self.handlers.push((kind, handler));
    }

    pub fn register_plugin(&mut self, mut plugin: Box<dyn SyncPlugin>) -> EngineResult<()> {
        let name = plugin.name().to_string();
        if self.plugins.iter().any(|p| p.name() == name) {
            return Err(EngineError::DuplicatePlugin(name));
        }
        let ctx = PluginContext {
            client_id: self.options.client_id.clone(),
            options: self.options.clone(),
        };
        plugin.initialize(&ctx)?;
        info!(client_id = %self.options.client_id, plugin = %name, "Plugin registered");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    /// Extract, diff against the last recorded state and send any changes
    pub fn sync(&mut self) -> SyncResult {
        let started = Instant::now();
        let current = self.extractor.extract(&self.model);
        if current.metadata.skipped > 0 {
            // An unextractable element would otherwise be diffed as removed
            let mut result = SyncResult::empty(None);
            result.success = false;
            result.errors.push(OperationError::new(
                ErrorCode::Extraction,
                Operation::Extract,
                format!("{} element(s) could not be extracted", current.metadata.skipped),
            ));
            result.duration_ms = started.elapsed().as_millis() as u64;
            warn!(
                client_id = %self.options.client_id,
                skipped = current.metadata.skipped,
                "Extraction incomplete; sync skipped"
            );
            self.report_failure(Operation::Extract, &result);
            return result;
        }
        let baseline = self.history.latest();
        let diff = self.calculator.calculate(baseline.as_deref(), &current);

        if !diff.has_changes {
            trace!(client_id = %self.options.client_id, "No local changes");
            return SyncResult::empty(None);
        }

        let mut result = SyncResult::empty(Some(diff.id.clone()));
        result.applied_changes = diff.change_count();
        debug!(
            client_id = %self.options.client_id,
            diff_id = %diff.id,
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            "Sending local diff"
        );

        let diff = Arc::new(diff);
        if let Err(e) = self.adapter.send_diff(diff.as_ref().clone()) {
            warn!(client_id = %self.options.client_id, diff_id = %diff.id, error = %e, "Failed to send local diff");
            result.success = false;
            result.errors.push(OperationError::new(e.code(), Operation::Send, e.to_string()));
        }
        // A failed send stays queued in the transport, so the new state is recorded either way
        self.history.record(current);

        result.duration_ms = started.elapsed().as_millis() as u64;
        self.counters.local_syncs += 1;
        self.counters.changes_sent += result.applied_changes as u64;
        self.track_duration(result.duration_ms);

        self.report_failure(Operation::Send, &result);
        self.emit(EngineEvent::LocalSync {
            diff,
            result: result.clone(),
        });
        result
    }

    /// Reconcile `diff` against the shared map and apply it to the model
    pub fn apply_remote(&mut self, diff: DocumentDiff) -> SyncResult {
        let started = Instant::now();
        let from_client = diff.client_id.clone();
        self.flush_local();

        let diff = if self.options.element_registry {
            self.reconcile(diff)
        } else {
            diff
        };
        let mut result = self.suppressed(|applicator, model| applicator.apply(&diff, model));
        self.settle();
        result.duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            client_id = %self.options.client_id,
            diff_id = %diff.id,
            from = %from_client,
            applied = result.applied_changes,
            warnings = result.warnings.len(),
            success = result.success,
            "Applied remote diff"
        );

        self.counters.remote_syncs += 1;
        self.counters.changes_applied += result.applied_changes as u64;
        self.track_duration(result.duration_ms);

        self.report_failure(Operation::Receive, &result);
        self.emit(EngineEvent::RemoteSync {
            diff_id: Some(diff.id.clone()),
            from_client: Some(from_client),
            result: result.clone(),
        });
        result
    }

    /// Apply every remote diff delivered so far
    pub fn drain_remote(&mut self) -> Vec<SyncResult> {
        let Some(mut rx) = self.remote_rx.take() else {
            return Vec::new();
        };
        let mut results = Vec::new();
        while let Ok(diff) = rx.try_recv() {
            results.push(self.apply_remote(diff));
        }
        self.remote_rx = Some(rx);
        results
    }

    /// Retry deferred connections that are due
    pub fn retry_pending(&mut self) -> SyncResult {
        let due = matches!(self.applicator.next_retry_due(), Some(at) if at <= tokio::time::Instant::now());
        if !due {
            return SyncResult::empty(None);
        }
        self.flush_local();
        let result = self.suppressed(|applicator, model| applicator.retry_pending(model));
        self.settle();

        self.report_failure(Operation::Retry, &result);
        if result.applied_changes > 0 || !result.warnings.is_empty() {
            self.counters.changes_applied += result.applied_changes as u64;
            self.emit(EngineEvent::RemoteSync {
                diff_id: None,
                from_client: None,
                result: result.clone(),
            });
        }
        result
    }

    pub fn next_retry_due(&self) -> Option<tokio::time::Instant> {
        self.applicator.next_retry_due()
    }

    /// Dispatch buffered model events now and drain the consolidated queue.
    ///
    /// Returns how many consolidated edit events were waiting.
    pub fn take_local_events(&mut self) -> usize {
        self.events.flush();
        let Some(rx) = self.local_rx.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    pub fn metrics(&self) -> EngineMetrics {
        let latest = self.history.latest();
        let timed = self.counters.local_syncs + self.counters.remote_syncs;
        EngineMetrics {
            client_id: self.options.client_id.clone(),
            local_syncs: self.counters.local_syncs,
            remote_syncs: self.counters.remote_syncs,
            sync_errors: self.counters.sync_errors,
            changes_sent: self.counters.changes_sent,
            changes_applied: self.counters.changes_applied,
            last_sync_ms: self.counters.last_sync_ms,
            average_sync_ms: if timed == 0 {
                0.0
            } else {
                self.counters.total_sync_ms as f64 / timed as f64
            },
            history_size: self.history.len(),
            state_version: latest.as_ref().map_or(0, |s| s.version),
            element_count: latest.as_ref().map_or(0, |s| s.len()),
            pending_retries: self.applicator.pending_len(),
            pending_sends: self.adapter.pending(),
            paused: self.paused,
            connection: self.adapter.connection_state().borrow().clone(),
            events: self.events.stats(),
            transport: self.adapter.stats(),
        }
    }

    /// Cancel timers, detach from the model and the transport, and hand the model back
    pub fn destroy(mut self) -> M {
        let dropped = self.events.cancel();
        let retries = self.applicator.pending_len();
        self.applicator.clear_pending();
        self.model.set_change_listener(None);
        self.adapter.close();
        for plugin in &mut self.plugins {
            plugin.destroy();
        }
        info!(
            client_id = %self.options.client_id,
            dropped_events = dropped,
            dropped_retries = retries,
            "Sync engine destroyed"
        );
        self.model
    }

    /// Send local changes made since the last tick, so re-extracting after a
    /// remote apply cannot absorb them
    fn flush_local(&mut self) {
        self.sync();
        if self.adapter.pending() > 0 {
            if let Err(e) = self.adapter.flush() {
                warn!(client_id = %self.options.client_id, error = %e, "Could not flush local diffs before remote apply");
            }
        }
    }

    /// Rewrite a remote diff so the registry's latest values win.
    ///
    /// Additions bring in the whole registry element. Modifications only
    /// touch the fields the incoming diff changed, so concurrent edits of
    /// other fields of the same element are left alone.
    fn reconcile(&mut self, mut diff: DocumentDiff) -> DocumentDiff {
        let mut added = Vec::new();
        let mut modified = Vec::new();

        let candidates = std::mem::take(&mut diff.added)
            .into_iter()
            .map(|el| (el.id, None))
            .chain(
                std::mem::take(&mut diff.modified)
                    .into_iter()
                    .map(|m| (m.id, Some(m.changes))),
            );
        let mut seen = HashSet::new();
        for (id, touched) in candidates {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(latest) = self.adapter.registry_element(&id) else {
                debug!(diff_id = %diff.id, element_id = %id, "Element removed concurrently; skipping");
                continue;
            };
            match self.extractor.extract_one(&self.model, id.as_str()) {
                None => added.push(latest),
                Some(local) => {
                    let mut changes = self.reconciler.detect_changes(&local, &latest);
                    if let Some(touched) = touched {
                        changes = changes
                            .into_iter()
                            .filter_map(|change| change.narrowed_to(&touched))
                            .collect();
                    }
                    if !changes.is_empty() {
                        modified.push(ModifiedElement {
                            id,
                            changes,
                            current: latest,
                        });
                    }
                }
            }
        }

        let adapter = &self.adapter;
        diff.removed.retain(|id| {
            let superseded = adapter.registry_element(id).is_some();
            if superseded {
                debug!(diff_id = %diff.id, element_id = %id, "Removal lost to a concurrent write; skipping");
            }
            !superseded
        });

        diff.added = dependency_order(added);
        diff.modified = modified;
        diff.refresh_statistics(&BTreeMap::new());
        diff
    }

    /// Run `f` with local change detection muted
    fn suppressed<R>(&mut self, f: impl FnOnce(&mut DiffApplicator, &mut M) -> R) -> R {
        self.suppress.store(true, Ordering::SeqCst);
        let out = f(&mut self.applicator, &mut self.model);
        self.suppress.store(false, Ordering::SeqCst);
        out
    }

    /// Record the post-merge model as the new baseline
    fn settle(&mut self) {
        let mut state = self.extractor.extract(&self.model);
        if state.metadata.skipped > 0 {
            // Keep the last good snapshot of elements that could not be extracted
            if let Some(previous) = self.history.latest() {
                for (id, el) in &previous.elements {
                    if !state.elements.contains_key(id) && self.model.contains(id.as_str()) {
                        state.elements.insert(id.clone(), el.clone());
                    }
                }
                state.metadata.element_count = state.elements.len();
            }
        }
        self.history.record(state);
    }

    fn track_duration(&mut self, ms: u64) {
        self.counters.last_sync_ms = ms;
        self.counters.total_sync_ms += ms;
    }

    fn report_failure(&mut self, operation: Operation, result: &SyncResult) {
        if result.errors.is_empty() {
            return;
        }
        self.counters.sync_errors += 1;
        self.emit(EngineEvent::SyncError {
            operation,
            errors: result.errors.clone(),
        });
    }

    fn emit(&mut self, event: EngineEvent) {
        let kind = event.kind();
        for (_, handler) in self.handlers.iter().filter(|(k, _)| *k == kind) {
            handler(&event);
        }
        for plugin in &mut self.plugins {
            plugin.on_event(&event);
        }
    }
}

impl<M> std::fmt::Debug for SyncEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("client_id", &self.options.client_id)
            .field("paused", &self.paused)
            .field("history", &self.history.len())
            .finish()
    }
}
