//! yrs-backed shared map and an in-process relay between documents
//!
//! ```text
//! Y.Doc
//! └── Y.Map "dsync"
//!     ├── "diff:<id>"             → envelope JSON
//!     ├── "element:<id>"          → ElementData JSON
//!     └── "field:<id>#<field>"    → FieldEntry JSON
//! ```

use crate::error::{TransportError, TransportResult};
use crate::shared_map::{ConnectionState, MapAction, MapCallback, MapEvent, MapOp, MapSubscription, SharedMap};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, Observable, ReadTxn, StateVector, Subscription, Transact, Update};

/// Name of the root map inside each document
pub const MAP_NAME: &str = "dsync";

/// Transaction origin used when the relay applies updates
pub const RELAY_ORIGIN: &str = "dsync-relay";

/// How often the relay re-synchronises even without new local updates
const RESYNC_INTERVAL: Duration = Duration::from_millis(250);

/// A shared map stored in one yrs document
#[derive(Clone)]
pub struct YrsSharedMap {
    inner: Arc<YrsInner>,
}

struct YrsInner {
    name: String,
    doc: Doc,
    map: MapRef,
    online: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl YrsSharedMap {
    pub fn new(name: impl Into<String>) -> Self {
        let doc = Doc::new();
        let map = doc.get_or_insert_map(MAP_NAME);
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            inner: Arc::new(YrsInner {
                name: name.into(),
                doc,
                map,
                online: AtomicBool::new(true),
                state,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn doc(&self) -> &Doc {
        &self.inner.doc
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Stop accepting writes and stop exchanging updates
    pub fn disconnect(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!(map = %self.inner.name, "Shared map disconnected");
    }

    pub fn reconnect(&self) {
        self.inner.online.store(true, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(map = %self.inner.name, "Shared map reconnected");
    }

    /// Go offline with an error state
    pub fn fail(&self, message: impl Into<String>) {
        self.inner.online.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Error(message.into()));
    }

    pub fn state_vector(&self) -> StateVector {
        self.inner.doc.transact().state_vector()
    }

    /// Everything this document has that `remote` lacks, as a v1 update
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.inner.doc.transact().encode_state_as_update_v1(remote)
    }

    /// Integrate a v1 update produced by another document
    pub fn apply_update(&self, update: &[u8], origin: &str) -> TransportResult<()> {
        let update = Update::decode_v1(update).map_err(|e| TransportError::Map(format!("decode update: {}", e)))?;
        let mut txn = self.inner.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| TransportError::Map(format!("apply update: {}", e)))
    }
}

impl SharedMap for YrsSharedMap {
    fn get(&self, key: &str) -> Option<String> {
        let txn = self.inner.doc.transact();
        self.inner.map.get(&txn, key).map(|value| value.to_string(&txn))
    }

    fn keys(&self) -> Vec<String> {
        let txn = self.inner.doc.transact();
        self.inner.map.keys(&txn).map(|k| k.to_string()).collect()
    }

    fn transact(&self, origin: &str, ops: Vec<MapOp>) -> TransportResult<()> {
        if !self.is_online() {
            return Err(TransportError::Disconnected);
        }
        let mut txn = self.inner.doc.transact_mut_with(origin);
        for op in ops {
            match op {
                MapOp::Set(key, value) => {
                    self.inner.map.insert(&mut txn, key, value);
                }
                MapOp::Delete(key) => {
                    self.inner.map.remove(&mut txn, &key);
                }
            }
        }
        Ok(())
    }

    fn observe(&self, callback: MapCallback) -> MapSubscription {
        let subscription = self.inner.map.observe(move |txn, event| {
            let origin = txn
                .origin()
                .map(|o| String::from_utf8_lossy(o.as_ref()).into_owned());
            let events: Vec<MapEvent> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let (action, value) = match change {
                        EntryChange::Inserted(value) => (MapAction::Add, value.clone().cast::<String>().ok()),
                        EntryChange::Updated(_, value) => (MapAction::Update, value.clone().cast::<String>().ok()),
                        EntryChange::Removed(_) => (MapAction::Delete, None),
                    };
                    MapEvent {
                        key: key.to_string(),
                        action,
                        origin: origin.clone(),
                        value,
                    }
                })
                .collect();
            if !events.is_empty() {
                callback(&events);
            }
        });
        MapSubscription::new(subscription)
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl std::fmt::Debug for YrsSharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsSharedMap")
            .field("name", &self.inner.name)
            .field("online", &self.is_online())
            .finish()
    }
}

/// Pumps updates between yrs documents in one process.
///
/// Stands in for a network provider: every attached document eventually
/// receives every other online document's updates.
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct RelayInner {
    peers: Mutex<Vec<YrsSharedMap>>,
    notify: Notify,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RelayInner {
    fn sync_round(&self) -> usize {
        let peers = self.peers.lock();
        let mut applied = 0;
        for (i, from) in peers.iter().enumerate() {
            if !from.is_online() {
                continue;
            }
            for (j, to) in peers.iter().enumerate() {
                if i == j || !to.is_online() {
                    continue;
                }
                let update = from.encode_diff(&to.state_vector());
                match to.apply_update(&update, RELAY_ORIGIN) {
                    Ok(()) => applied += 1,
                    Err(e) => warn!(from = %from.name(), to = %to.name(), error = %e, "Relay failed to apply update"),
                }
            }
        }
        applied
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                peers: Mutex::new(Vec::new()),
                notify: Notify::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start relaying updates of `peer`
    pub fn attach(&self, peer: &YrsSharedMap) -> TransportResult<()> {
        let relay: Weak<RelayInner> = Arc::downgrade(&self.inner);
        let subscription = peer
            .doc()
            .observe_update_v1(move |txn, _event| {
                let relayed = txn
                    .origin()
                    .map_or(false, |o| o.as_ref() == RELAY_ORIGIN.as_bytes());
                if !relayed {
                    if let Some(relay) = relay.upgrade() {
                        relay.notify.notify_one();
                    }
                }
            })
            .map_err(|e| TransportError::Map(format!("observe updates: {}", e)))?;
        self.inner.subscriptions.lock().push(subscription);
        self.inner.peers.lock().push(peer.clone());
        debug!(peer = %peer.name(), "Attached peer to relay");
        Ok(())
    }

    pub fn peers(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Run one exchange between every pair of online peers
    pub fn sync_now(&self) -> usize {
        self.inner.sync_round()
    }

    /// Relay in the background, delaying each exchange by `latency`
    pub fn start(&self, latency: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                inner.sync_round();
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(peers = self.peers(), latency_ms = latency.as_millis() as u64, "Relay started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(map: &YrsSharedMap, origin: &str, key: &str, value: &str) {
        map.transact(origin, vec![MapOp::Set(key.into(), value.into())]).unwrap();
    }

    #[test]
    fn test_get_set_delete() {
        let map = YrsSharedMap::new("a");
        set(&map, "a", "diff:1", "{}");
        assert_eq!(map.get("diff:1").as_deref(), Some("{}"));
        assert_eq!(map.keys(), vec!["diff:1".to_string()]);

        map.transact("a", vec![MapOp::Delete("diff:1".into())]).unwrap();
        assert!(map.get("diff:1").is_none());
    }

    #[test]
    fn test_observer_sees_origin_and_value() {
        let map = YrsSharedMap::new("a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = map.observe(Arc::new(move |events: &[MapEvent]| sink.lock().extend_from_slice(events)));

        set(&map, "client-a", "k", "v1");
        set(&map, "client-b", "k", "v2");
        map.transact("client-b", vec![MapOp::Delete("k".into())]).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].action, MapAction::Add);
        assert_eq!(seen[0].origin.as_deref(), Some("client-a"));
        assert_eq!(seen[1].action, MapAction::Update);
        assert_eq!(seen[1].value.as_deref(), Some("v2"));
        assert_eq!(seen[2].action, MapAction::Delete);
    }

    #[test]
    fn test_disconnected_map_rejects_writes() {
        let map = YrsSharedMap::new("a");
        let state = map.connection_state();
        map.disconnect();
        assert!(matches!(map.transact("a", vec![]), Err(TransportError::Disconnected)));
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        map.reconnect();
        assert!(state.borrow().is_connected());
        assert!(map.transact("a", vec![]).is_ok());
    }

    #[test]
    fn test_relay_exchanges_updates() {
        let a = YrsSharedMap::new("a");
        let b = YrsSharedMap::new("b");
        let relay = MemoryRelay::new();
        relay.attach(&a).unwrap();
        relay.attach(&b).unwrap();

        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        let _sub = b.observe(Arc::new(move |events: &[MapEvent]| {
            sink.lock().extend(events.iter().map(|e| e.origin.clone()))
        }));

        set(&a, "client-a", "diff:1", "payload");
        relay.sync_now();
        assert_eq!(b.get("diff:1").as_deref(), Some("payload"));
        assert_eq!(origins.lock()[0].as_deref(), Some(RELAY_ORIGIN));

        b.disconnect();
        set(&a, "client-a", "diff:2", "later");
        relay.sync_now();
        assert!(b.get("diff:2").is_none());

        b.reconnect();
        relay.sync_now();
        assert_eq!(b.get("diff:2").as_deref(), Some("later"));
    }

    #[test]
    fn test_relay_propagates_deletes() {
        let a = YrsSharedMap::new("a");
        let b = YrsSharedMap::new("b");
        let relay = MemoryRelay::new();
        relay.attach(&a).unwrap();
        relay.attach(&b).unwrap();

        set(&a, "client-a", "element:s1", "{}");
        relay.sync_now();
        a.transact("client-a", vec![MapOp::Delete("element:s1".into())]).unwrap();
        relay.sync_now();
        assert!(b.get("element:s1").is_none());
    }
}
