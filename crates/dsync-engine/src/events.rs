//! Raw model notifications -> deduplicated, consolidated edit events
//!
//! A single drag fires dozens of near-identical move notifications. The
//! [`EventDeduplicator`] drops repeats seen within a short window, and the
//! [`UnifiedEventManager`] buffers bursts and hands only the latest event of
//! each consolidation group to its handlers.

use crate::config::EventConfig;
use dsync_core::{ChangeAction, ModelEvent, Point, Scheduler};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Grid that positions, sizes and waypoints snap to before hashing
pub const DEDUP_GRID: f64 = 5.0;

const FLUSH_TASK: &str = "flush";

fn snap(v: f64) -> i64 {
    ((v / DEDUP_GRID).round() * DEDUP_GRID) as i64
}

fn snap_point(p: &Point) -> (i64, i64) {
    (snap(p.x), snap(p.y))
}

/// The part of an event that decides whether it repeats an earlier one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    event_type: String,
    element_id: String,
    action: ChangeAction,
    position: Option<(i64, i64)>,
    size: Option<(i64, i64)>,
    properties: Vec<String>,
    waypoints: Option<Vec<(i64, i64)>>,
}

impl Fingerprint {
    fn of(event: &ModelEvent) -> Self {
        let mut properties = event.properties.clone();
        properties.sort();
        properties.dedup();
        Self {
            event_type: event.event_type.clone(),
            element_id: event.element_id.to_string(),
            action: event.action,
            position: event.position.as_ref().map(snap_point),
            size: event.size.map(|s| (snap(s.width), snap(s.height))),
            properties,
            waypoints: event.waypoints.as_ref().map(|w| w.iter().map(snap_point).collect()),
        }
    }

    fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug)]
struct Seen {
    at: Instant,
    hash: u64,
    fingerprint: Fingerprint,
}

/// Bounded FIFO of recently seen event fingerprints
#[derive(Debug)]
pub struct EventDeduplicator {
    window: Duration,
    capacity: usize,
    seen: VecDeque<Seen>,
}

impl EventDeduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: VecDeque::new(),
        }
    }

    /// Whether an equivalent event was seen within the window.
    ///
    /// A non-duplicate is recorded, evicting the oldest entry when full.
    pub fn is_duplicate(&mut self, event: &ModelEvent) -> bool {
        let now = Instant::now();
        self.prune(now);

        let fingerprint = Fingerprint::of(event);
        let hash = fingerprint.hash_value();
        if self
            .seen
            .iter()
            .any(|s| s.hash == hash && s.fingerprint == fingerprint)
        {
            return true;
        }

        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(Seen { at: now, hash, fingerprint });
        false
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.seen.front() {
            if now.duration_since(front.at) > self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Grouping key: only the latest event per group survives a flush
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsolidationKey {
    class: String,
    element_id: String,
    properties: Vec<String>,
}

impl ConsolidationKey {
    fn of(event: &ModelEvent) -> Self {
        let class = event
            .event_type
            .split('.')
            .next()
            .unwrap_or(event.event_type.as_str())
            .to_string();
        let properties = if event.action == ChangeAction::UpdateProperties {
            let mut props = event.properties.clone();
            props.sort();
            props.dedup();
            props
        } else {
            Vec::new()
        };
        Self {
            class: format!("{}:{}", class, event.action.as_str()),
            element_id: event.element_id.to_string(),
            properties,
        }
    }
}

/// Keep the most recent event of each group, in order of first appearance
pub fn consolidate(events: Vec<ModelEvent>) -> Vec<ModelEvent> {
    let mut slots: HashMap<ConsolidationKey, usize> = HashMap::new();
    let mut survivors: Vec<ModelEvent> = Vec::new();
    for event in events {
        let key = ConsolidationKey::of(&event);
        match slots.get(&key) {
            Some(&i) => survivors[i] = event,
            None => {
                slots.insert(key, survivors.len());
                survivors.push(event);
            }
        }
    }
    survivors
}

/// Error a handler reports back; logged, never propagated
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives consolidated events
pub type EventHandler = Arc<dyn Fn(&ModelEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Counters for one event manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub received: u64,
    pub duplicates: u64,
    pub consolidated: u64,
    pub dispatched: u64,
    pub handler_errors: u64,
}

struct ManagerInner {
    config: EventConfig,
    dedup: Mutex<EventDeduplicator>,
    buffer: Mutex<Vec<ModelEvent>>,
    handlers: RwLock<Vec<EventHandler>>,
    scheduler: Scheduler<&'static str>,
    stats: Mutex<EventStats>,
}

impl ManagerInner {
    fn flush(&self) -> usize {
        let buffered = std::mem::take(&mut *self.buffer.lock());
        if buffered.is_empty() {
            return 0;
        }
        let total = buffered.len();
        let survivors = consolidate(buffered);
        self.stats.lock().consolidated += (total - survivors.len()) as u64;
        trace!(buffered = total, survivors = survivors.len(), "Flushing event buffer");
        for event in &survivors {
            self.dispatch(event);
        }
        survivors.len()
    }

    fn dispatch(&self, event: &ModelEvent) {
        let handlers: Vec<EventHandler> = self.handlers.read().clone();
        let mut failures = 0;
        for handler in &handlers {
            if let Err(e) = handler(event) {
                warn!(
                    event_type = %event.event_type,
                    element_id = %event.element_id,
                    error = %e,
                    "Event handler failed"
                );
                failures += 1;
            }
        }
        let mut stats = self.stats.lock();
        stats.dispatched += 1;
        stats.handler_errors += failures;
    }

    fn schedule_flush(self: &Arc<Self>) {
        let weak: Weak<ManagerInner> = Arc::downgrade(self);
        self.scheduler.schedule(FLUSH_TASK, self.config.debounce, move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush();
            }
        });
    }
}

/// Deduplicates, debounces and consolidates model notifications
#[derive(Clone)]
pub struct UnifiedEventManager {
    inner: Arc<ManagerInner>,
}

impl UnifiedEventManager {
    pub fn new(config: EventConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                dedup: Mutex::new(EventDeduplicator::new(config.dedup_window, config.dedup_capacity)),
                buffer: Mutex::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
                scheduler: Scheduler::new(),
                stats: Mutex::new(EventStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.inner.config
    }

    pub fn on<F>(&self, handler: F)
    where
        F: Fn(&ModelEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Ingest one raw notification; returns false if it was a duplicate.
    ///
    /// Each accepted event restarts the debounce timer, so a burst is
    /// dispatched once it goes quiet.
    pub fn emit(&self, event: ModelEvent) -> bool {
        self.inner.stats.lock().received += 1;
        if self.inner.dedup.lock().is_duplicate(&event) {
            debug!(element_id = %event.element_id, action = event.action.as_str(), "Dropping duplicate event");
            self.inner.stats.lock().duplicates += 1;
            return false;
        }

        if !self.inner.config.batching {
            self.inner.dispatch(&event);
            return true;
        }

        self.inner.buffer.lock().push(event);
        self.inner.schedule_flush();
        true
    }

    /// Dispatch whatever is buffered now; returns how many events survived
    pub fn flush(&self) -> usize {
        self.inner.scheduler.cancel(&FLUSH_TASK);
        self.inner.flush()
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Drop buffered events and cancel the debounce timer
    pub fn cancel(&self) -> usize {
        self.inner.scheduler.cancel_all();
        let dropped = std::mem::take(&mut *self.inner.buffer.lock()).len();
        if dropped > 0 {
            debug!(dropped, "Discarded buffered events");
        }
        dropped
    }

    pub fn stats(&self) -> EventStats {
        *self.inner.stats.lock()
    }
}

impl std::fmt::Debug for UnifiedEventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedEventManager")
            .field("config", &self.inner.config)
            .field("buffered", &self.buffered())
            .finish()
    }
}
