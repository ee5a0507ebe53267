//! TransportAdapter - diffs in and out of the shared map
//!
//! Outgoing diffs are tagged with the local client id, optionally batched for
//! a short window, and written in one transaction whose origin is that client
//! id. Incoming changes with a foreign origin are decoded, deduplicated and
//! handed to the registered callback.

use crate::error::{TransportError, TransportResult};
use crate::shared_map::{ConnectionState, MapAction, MapCallback, MapEvent, MapOp, MapSubscription, SharedMap};
use dsync_core::{DocumentDiff, ElementData, ElementId, Scheduler};
use dsync_protocol::keys::{DIFF_PREFIX, ELEMENT_PREFIX, FIELD_PREFIX};
use dsync_protocol::{
    decode_diff, diff_key, element_key, encode_diff, field_entries, field_prefix, FieldEntry, MapKey,
    DEFAULT_COMPRESSION_THRESHOLD,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const FLUSH_TASK: &str = "flush";

/// Transport adapter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub client_id: String,
    /// Collect diffs sent within `batch_window` into one transaction
    pub batching: bool,
    pub batch_window: Duration,
    /// Retries after a failed write before reporting an error state
    pub max_retries: u32,
    /// Base delay; the n-th retry waits `n * backoff`
    pub backoff: Duration,
    pub compression_threshold: usize,
    /// Own diff keys kept in the map; older ones are deleted
    pub max_retained_diffs: usize,
    /// Mirror each element under `element:<id>` and its modified fields under `field:<id>#<field>`
    pub element_registry: bool,
    /// Diff ids remembered for duplicate rejection
    pub recent_capacity: usize,
}

impl AdapterConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            batching: true,
            batch_window: Duration::from_millis(100),
            max_retries: 3,
            backoff: Duration::from_millis(50),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_retained_diffs: 64,
            element_registry: true,
            recent_capacity: 256,
        }
    }
}

/// Counters for one adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub duplicates: u64,
    pub failures: u64,
    pub retries: u64,
    pub pruned: u64,
}

/// Bounded set of recently seen ids, evicted in insertion order
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if `id` was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[derive(Debug, Default)]
struct Outbox {
    diffs: Vec<DocumentDiff>,
    attempts: u32,
}

struct AdapterInner {
    config: AdapterConfig,
    map: Arc<dyn SharedMap>,
    outbox: Mutex<Outbox>,
    recent: Arc<Mutex<RecentIds>>,
    retained: Mutex<VecDeque<String>>,
    scheduler: Scheduler<&'static str>,
    state: watch::Sender<ConnectionState>,
    subscription: Mutex<Option<MapSubscription>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<TransportStats>>,
    closed: AtomicBool,
}

impl AdapterInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn schedule_flush(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<AdapterInner> = Arc::downgrade(self);
        self.scheduler.schedule(FLUSH_TASK, delay, move || {
            if let Some(inner) = weak.upgrade() {
                // Failures are retried or surfaced through the connection state
                let _ = inner.flush();
            }
        });
    }

    /// Write every queued diff in one transaction
    fn flush(self: &Arc<Self>) -> TransportResult<usize> {
        let diffs = std::mem::take(&mut self.outbox.lock().diffs);
        if diffs.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::new();
        let mut encoded = Vec::with_capacity(diffs.len());
        let mut registry = RegistryWrites::new(self.map.as_ref());
        for diff in &diffs {
            match encode_diff(diff, self.config.compression_threshold) {
                Ok(wire) => {
                    ops.push(MapOp::Set(diff_key(&diff.id), wire));
                    encoded.push(diff.id.clone());
                }
                Err(e) => {
                    error!(diff_id = %diff.id, error = %e, "Failed to encode diff; not sent");
                    self.stats.lock().failures += 1;
                    continue;
                }
            }
            if self.config.element_registry {
                registry.push(diff, &mut ops);
            }
        }

        let mut retained = self.retained.lock().clone();
        retained.extend(encoded.iter().cloned());
        let mut pruned = 0;
        while retained.len() > self.config.max_retained_diffs.max(1) {
            if let Some(old) = retained.pop_front() {
                ops.push(MapOp::Delete(diff_key(&old)));
                pruned += 1;
            }
        }

        match self.map.transact(&self.config.client_id, ops) {
            Ok(()) => {
                *self.retained.lock() = retained;
                self.outbox.lock().attempts = 0;
                {
                    let mut stats = self.stats.lock();
                    stats.sent += encoded.len() as u64;
                    stats.pruned += pruned;
                }
                self.set_state(ConnectionState::Connected);
                debug!(
                    client_id = %self.config.client_id,
                    diffs = encoded.len(),
                    pruned,
                    "Sent diffs"
                );
                Ok(encoded.len())
            }
            Err(e) => {
                let attempts = {
                    let mut outbox = self.outbox.lock();
                    let newer = std::mem::replace(&mut outbox.diffs, diffs);
                    outbox.diffs.extend(newer);
                    outbox.attempts += 1;
                    outbox.attempts
                };
                self.stats.lock().failures += 1;

                if e.is_retryable() && attempts <= self.config.max_retries && !self.closed.load(Ordering::SeqCst) {
                    let delay = self.config.backoff * attempts;
                    warn!(
                        client_id = %self.config.client_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed; retrying"
                    );
                    self.stats.lock().retries += 1;
                    self.schedule_flush(delay);
                    Err(e)
                } else {
                    error!(
                        client_id = %self.config.client_id,
                        attempts,
                        error = %e,
                        "Send failed; diffs kept until the map reconnects"
                    );
                    self.set_state(ConnectionState::Error(e.to_string()));
                    Err(TransportError::RetriesExhausted {
                        attempts,
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Registry writes mirroring a batch of diffs
struct RegistryWrites<'a> {
    map: &'a dyn SharedMap,
    /// Field keys set earlier in the same transaction
    written: HashMap<ElementId, BTreeSet<String>>,
}

impl<'a> RegistryWrites<'a> {
    fn new(map: &'a dyn SharedMap) -> Self {
        Self {
            map,
            written: HashMap::new(),
        }
    }

    fn push(&mut self, diff: &DocumentDiff, ops: &mut Vec<MapOp>) {
        for el in &diff.added {
            self.clear_fields(&el.id, ops);
            put_element(el, ops);
        }
        for entry in &diff.modified {
            put_element(&entry.current, ops);
            for field in field_entries(&entry.id, &entry.changes) {
                match serde_json::to_string(&field) {
                    Ok(json) => {
                        let key = field.key();
                        self.written.entry(entry.id.clone()).or_default().insert(key.clone());
                        ops.push(MapOp::Set(key, json));
                    }
                    Err(e) => warn!(element_id = %entry.id, error = %e, "Failed to encode registry field"),
                }
            }
        }
        for id in &diff.removed {
            ops.push(MapOp::Delete(element_key(id)));
            self.clear_fields(id, ops);
        }
    }

    /// Delete every field entry of `id`, including ones set earlier in this batch
    fn clear_fields(&mut self, id: &ElementId, ops: &mut Vec<MapOp>) {
        let mut keys = self.written.remove(id).unwrap_or_default();
        keys.extend(stored_fields(self.map, id).into_iter().map(|(key, _)| key));
        ops.extend(keys.into_iter().map(MapOp::Delete));
    }
}

fn put_element(el: &ElementData, ops: &mut Vec<MapOp>) {
    match serde_json::to_string(el) {
        Ok(json) => ops.push(MapOp::Set(element_key(&el.id), json)),
        Err(e) => warn!(element_id = %el.id, error = %e, "Failed to encode registry entry"),
    }
}

/// Field entries stored for `id`
fn stored_fields(map: &dyn SharedMap, id: &ElementId) -> Vec<(String, FieldEntry)> {
    map.entries_with_prefix(&field_prefix(id))
        .into_iter()
        .filter_map(|(key, json)| match serde_json::from_str::<FieldEntry>(&json) {
            Ok(entry) if entry.id == *id => Some((key, entry)),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Invalid registry field");
                None
            }
        })
        .collect()
}

/// Sends and receives diffs through a [`SharedMap`]
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<AdapterInner>,
}

impl TransportAdapter {
    pub fn new(map: Arc<dyn SharedMap>, config: AdapterConfig) -> Self {
        let initial = map.connection_state().borrow().clone();
        let (state, _) = watch::channel(initial);
        let recent = RecentIds::new(config.recent_capacity);
        Self {
            inner: Arc::new(AdapterInner {
                config,
                map,
                outbox: Mutex::new(Outbox::default()),
                recent: Arc::new(Mutex::new(recent)),
                retained: Mutex::new(VecDeque::new()),
                scheduler: Scheduler::new(),
                state,
                subscription: Mutex::new(None),
                watcher: Mutex::new(None),
                stats: Arc::new(Mutex::new(TransportStats::default())),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Follow the map's connection state and flush queued diffs on reconnect
    pub fn start(&self) {
        let Ok(handle) = Handle::try_current() else {
            debug!("No runtime; connection state is not followed");
            return;
        };
        let mut upstream = self.inner.map.connection_state();
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            loop {
                let state = upstream.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };
                info!(client_id = %inner.config.client_id, state = %state, "Connection state changed");
                let connected = state.is_connected();
                inner.set_state(state);
                if connected && !inner.outbox.lock().diffs.is_empty() {
                    inner.outbox.lock().attempts = 0;
                    let _ = inner.flush();
                }
                drop(inner);
                if upstream.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.inner.watcher.lock().replace(task) {
            previous.abort();
        }
    }

    /// Queue `diff` for sending.
    ///
    /// Without batching the write happens immediately and its error is
    /// returned; the diff stays queued for retry either way.
    pub fn send_diff(&self, mut diff: DocumentDiff) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        diff.client_id = self.inner.config.client_id.clone();
        self.inner.recent.lock().insert(&diff.id);
        trace!(diff_id = %diff.id, "Queued diff");
        self.inner.outbox.lock().diffs.push(diff);

        if self.inner.config.batching {
            if !self.inner.scheduler.is_scheduled(&FLUSH_TASK) {
                self.inner.schedule_flush(self.inner.config.batch_window);
            }
            Ok(())
        } else {
            self.inner.flush().map(|_| ())
        }
    }

    /// Write queued diffs now, cancelling any pending batch timer
    pub fn flush(&self) -> TransportResult<usize> {
        self.inner.scheduler.cancel(&FLUSH_TASK);
        self.inner.flush()
    }

    /// Diffs queued but not yet written
    pub fn pending(&self) -> usize {
        self.inner.outbox.lock().diffs.len()
    }

    /// Deliver foreign diffs to `callback`.
    ///
    /// The callback runs inside the shared map's transaction; it must hand
    /// the diff off (e.g. into a channel) rather than touch the map.
    pub fn on_remote_diff<F>(&self, callback: F)
    where
        F: Fn(DocumentDiff) + Send + Sync + 'static,
    {
        let client_id = self.inner.config.client_id.clone();
        let recent = self.inner.recent.clone();
        let stats = self.inner.stats.clone();

        let observer: MapCallback = Arc::new(move |events: &[MapEvent]| {
            for event in events {
                if event.origin.as_deref() == Some(client_id.as_str()) {
                    continue;
                }
                if !MapKey::is_diff(&event.key) || event.action == MapAction::Delete {
                    continue;
                }
                let Some(value) = &event.value else {
                    warn!(key = %event.key, "Diff key changed without a string value");
                    continue;
                };
                let diff = match decode_diff(value) {
                    Ok(diff) => diff,
                    Err(e) => {
                        warn!(key = %event.key, error = %e, "Rejecting undecodable remote diff");
                        stats.lock().failures += 1;
                        continue;
                    }
                };
                if diff.client_id == client_id {
                    continue;
                }
                if !recent.lock().insert(&diff.id) {
                    debug!(diff_id = %diff.id, "Ignoring duplicate remote diff");
                    stats.lock().duplicates += 1;
                    continue;
                }
                stats.lock().received += 1;
                callback(diff);
            }
        });

        let subscription = self.inner.map.observe(observer);
        *self.inner.subscription.lock() = Some(subscription);
    }

    /// Latest registry entry for `id`, with its field entries applied
    pub fn registry_element(&self, id: &ElementId) -> Option<ElementData> {
        let json = self.inner.map.get(&element_key(id))?;
        let mut el: ElementData = match serde_json::from_str(&json) {
            Ok(el) => el,
            Err(e) => {
                warn!(element_id = %id, error = %e, "Invalid registry entry");
                return None;
            }
        };
        for (_, entry) in stored_fields(self.inner.map.as_ref(), id) {
            entry.field.apply_to(&mut el);
        }
        Some(el)
    }

    /// Every registry entry, with field entries applied
    pub fn registry(&self) -> HashMap<ElementId, ElementData> {
        let mut elements: HashMap<ElementId, ElementData> = self
            .inner
            .map
            .entries_with_prefix(ELEMENT_PREFIX)
            .into_iter()
            .filter_map(|(key, json)| match serde_json::from_str::<ElementData>(&json) {
                Ok(el) => Some((el.id.clone(), el)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Invalid registry entry");
                    None
                }
            })
            .collect();

        for (key, json) in self.inner.map.entries_with_prefix(FIELD_PREFIX) {
            match serde_json::from_str::<FieldEntry>(&json) {
                Ok(entry) => {
                    // Fields outlive a concurrently removed element
                    if let Some(el) = elements.get_mut(&entry.id) {
                        entry.field.apply_to(el);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Invalid registry field"),
            }
        }
        elements
    }

    /// Every diff still retained in the map, oldest first
    pub fn retained_diffs(&self) -> Vec<DocumentDiff> {
        let mut diffs: Vec<DocumentDiff> = self
            .inner
            .map
            .entries_with_prefix(DIFF_PREFIX)
            .into_iter()
            .filter_map(|(key, wire)| match decode_diff(&wire) {
                Ok(diff) => Some(diff),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable retained diff");
                    None
                }
            })
            .collect();
        diffs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.client_id.cmp(&b.client_id))
                .then_with(|| a.to_version.cmp(&b.to_version))
                .then_with(|| a.id.cmp(&b.id))
        });
        diffs
    }

    /// Mark ids as already seen, e.g. after replaying them
    pub fn remember(&self, diff_ids: impl IntoIterator<Item = String>) {
        let mut recent = self.inner.recent.lock();
        for id in diff_ids {
            recent.insert(&id);
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> TransportStats {
        *self.inner.stats.lock()
    }

    /// Flush what can be flushed, then stop timers and observers
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.scheduler.cancel_all();
        if let Err(e) = self.inner.flush() {
            warn!(client_id = %self.client_id(), error = %e, "Unsent diffs at close");
        }
        self.inner.subscription.lock().take();
        if let Some(task) = self.inner.watcher.lock().take() {
            task.abort();
        }
        info!(client_id = %self.client_id(), "Transport closed");
    }
}

impl std::fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("client_id", &self.inner.config.client_id)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yrs_map::{MemoryRelay, YrsSharedMap};
    use dsync_core::{Change, ModifiedElement, Point, PropertyMap, Size};

    fn diff_from(client: &str, shape: &str) -> DocumentDiff {
        let mut diff = DocumentDiff::new(client, 0, 1);
        diff.added.push(ElementData::shape(shape, "Task", Point::new(0.0, 0.0), Size::new(10.0, 10.0)));
        diff.refresh_statistics(&Default::default());
        diff
    }

    fn unbatched(client: &str) -> AdapterConfig {
        AdapterConfig {
            batching: false,
            ..AdapterConfig::new(client)
        }
    }

    fn collector(adapter: &TransportAdapter) -> Arc<Mutex<Vec<DocumentDiff>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        adapter.on_remote_diff(move |diff| sink.lock().push(diff));
        seen
    }

    #[test]
    fn test_own_writes_are_not_delivered() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let a = TransportAdapter::new(map.clone(), unbatched("a"));
        let b = TransportAdapter::new(map.clone(), unbatched("b"));
        let seen_a = collector(&a);
        let seen_b = collector(&b);

        a.send_diff(diff_from("ignored", "s1")).unwrap();
        assert!(seen_a.lock().is_empty());
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_b.lock()[0].client_id, "a");
        assert_eq!(b.registry_element(&"s1".into()).unwrap().id.as_str(), "s1");
    }

    #[test]
    fn test_remote_diffs_cross_relay_once() {
        let map_a = YrsSharedMap::new("a");
        let map_b = YrsSharedMap::new("b");
        let relay = MemoryRelay::new();
        relay.attach(&map_a).unwrap();
        relay.attach(&map_b).unwrap();

        let a = TransportAdapter::new(Arc::new(map_a), unbatched("a"));
        let b = TransportAdapter::new(Arc::new(map_b), unbatched("b"));
        let seen_a = collector(&a);
        let seen_b = collector(&b);

        let diff = diff_from("a", "s1");
        a.send_diff(diff.clone()).unwrap();
        relay.sync_now();
        relay.sync_now();

        assert!(seen_a.lock().is_empty());
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_b.lock()[0].id, diff.id);
        assert_eq!(b.stats().received, 1);
    }

    #[test]
    fn test_removed_elements_leave_registry() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let a = TransportAdapter::new(map.clone(), unbatched("a"));
        a.send_diff(diff_from("a", "s1")).unwrap();

        let mut removal = DocumentDiff::new("a", 1, 2);
        removal.removed.push("s1".into());
        a.send_diff(removal).unwrap();

        assert!(a.registry_element(&"s1".into()).is_none());
        assert_eq!(a.retained_diffs().len(), 2);
    }

    fn modification(client: &str, current: ElementData, changes: Vec<Change>) -> DocumentDiff {
        let mut diff = DocumentDiff::new(client, 1, 2);
        diff.modified.push(ModifiedElement {
            id: current.id.clone(),
            changes,
            current,
        });
        diff.refresh_statistics(&Default::default());
        diff
    }

    fn moved_and_renamed() -> (DocumentDiff, DocumentDiff) {
        let base = ElementData::shape("s1", "Task", Point::new(0.0, 0.0), Size::new(10.0, 10.0));

        let mut moved = base.clone();
        moved.kind = dsync_core::ElementKind::Shape {
            position: Some(Point::new(300.0, 300.0)),
            size: Some(Size::new(10.0, 10.0)),
        };
        let move_diff = modification(
            "a",
            moved,
            vec![Change::Position {
                old: Point::new(0.0, 0.0),
                new: Point::new(300.0, 300.0),
                delta: Point::new(300.0, 300.0),
            }],
        );

        let mut renamed = base;
        renamed.business_object.insert("name".into(), "Renamed".into());
        let rename_diff = modification(
            "b",
            renamed.clone(),
            vec![Change::BusinessObject {
                old: PropertyMap::new(),
                new: renamed.business_object,
                changed_keys: vec!["name".into()],
            }],
        );
        (move_diff, rename_diff)
    }

    #[test]
    fn test_registry_keeps_concurrent_field_writes() {
        let map_a = YrsSharedMap::new("a");
        let map_b = YrsSharedMap::new("b");
        let relay = MemoryRelay::new();
        relay.attach(&map_a).unwrap();
        relay.attach(&map_b).unwrap();
        let a = TransportAdapter::new(Arc::new(map_a), unbatched("a"));
        let b = TransportAdapter::new(Arc::new(map_b), unbatched("b"));

        a.send_diff(diff_from("a", "s1")).unwrap();
        relay.sync_now();

        let (move_diff, rename_diff) = moved_and_renamed();
        a.send_diff(move_diff).unwrap();
        b.send_diff(rename_diff).unwrap();
        relay.sync_now();
        relay.sync_now();

        for adapter in [&a, &b] {
            let el = adapter.registry_element(&"s1".into()).unwrap();
            assert_eq!(el.position(), Some(Point::new(300.0, 300.0)));
            assert_eq!(el.business_object.get("name"), Some(&"Renamed".into()));
            assert_eq!(adapter.registry()[&ElementId::from("s1")], el);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_clears_fields_written_in_same_batch() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let a = TransportAdapter::new(map.clone(), AdapterConfig::new("a"));
        a.send_diff(diff_from("a", "s1")).unwrap();
        a.flush().unwrap();

        let (move_diff, _) = moved_and_renamed();
        a.send_diff(move_diff).unwrap();
        let mut removal = DocumentDiff::new("a", 2, 3);
        removal.removed.push("s1".into());
        a.send_diff(removal).unwrap();
        a.flush().unwrap();

        assert!(map.entries_with_prefix(FIELD_PREFIX).is_empty());
        assert!(a.registry().is_empty());

        // A re-added element starts without stale fields
        a.send_diff(diff_from("a", "s1")).unwrap();
        a.flush().unwrap();
        assert_eq!(a.registry_element(&"s1".into()).unwrap().position(), Some(Point::new(0.0, 0.0)));
    }

    #[test]
    fn test_pruning_keeps_newest_diffs() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let config = AdapterConfig {
            max_retained_diffs: 2,
            ..unbatched("a")
        };
        let a = TransportAdapter::new(map.clone(), config);
        let ids: Vec<String> = (0..4)
            .map(|i| {
                let diff = diff_from("a", &format!("s{}", i));
                let id = diff.id.clone();
                a.send_diff(diff).unwrap();
                id
            })
            .collect();

        assert!(map.get(&diff_key(&ids[0])).is_none());
        assert!(map.get(&diff_key(&ids[1])).is_none());
        assert!(map.get(&diff_key(&ids[3])).is_some());
        assert_eq!(a.stats().pruned, 2);
        // Registry entries survive pruning
        assert!(a.registry_element(&"s0".into()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batching_writes_one_transaction() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let a = TransportAdapter::new(map.clone(), AdapterConfig::new("a"));
        let b = TransportAdapter::new(map.clone(), unbatched("b"));

        let transactions = Arc::new(Mutex::new(0usize));
        let counter = transactions.clone();
        let _sub = map.observe(Arc::new(move |_events: &[MapEvent]| *counter.lock() += 1));
        let seen_b = collector(&b);

        a.send_diff(diff_from("a", "s1")).unwrap();
        a.send_diff(diff_from("a", "s2")).unwrap();
        assert_eq!(a.pending(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(a.pending(), 0);
        assert_eq!(*transactions.lock(), 1);
        assert_eq!(seen_b.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_retries_then_reports_error() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let a = TransportAdapter::new(map.clone(), unbatched("a"));
        let state = a.connection_state();
        map.disconnect();

        assert!(matches!(a.send_diff(diff_from("a", "s1")), Err(TransportError::Disconnected)));
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let stats = a.stats();
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.failures, 4);
        assert!(matches!(*state.borrow(), ConnectionState::Error(_)));
        assert_eq!(a.pending(), 1);

        // Never dropped: written once the map is back
        map.reconnect();
        assert_eq!(a.flush().unwrap(), 1);
        assert!(state.borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_flushes_queue() {
        let map = Arc::new(YrsSharedMap::new("shared"));
        let config = AdapterConfig {
            max_retries: 0,
            ..unbatched("a")
        };
        let a = TransportAdapter::new(map.clone(), config);
        a.start();
        map.disconnect();
        let _ = a.send_diff(diff_from("a", "s1"));
        assert_eq!(a.pending(), 1);

        map.reconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.pending(), 0);
        a.close();
        assert!(matches!(a.send_diff(diff_from("a", "s2")), Err(TransportError::Closed)));
    }
}
