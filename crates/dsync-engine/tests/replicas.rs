//! Convergence between replicas sharing one relayed document

use dsync_core::{ConnectionSpec, DiagramModel, MemoryModel, Point, PropertyPatch, ShapeSpec, Size};
use dsync_engine::{EngineEventKind, SyncEngine, SyncOptions};
use dsync_transport::{MemoryRelay, SharedMap, YrsSharedMap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn options(client_id: &str) -> SyncOptions {
    SyncOptions {
        transport_batching: false,
        event_batching: false,
        ..SyncOptions::new(client_id)
    }
}

fn shape(id: &str, x: f64) -> ShapeSpec {
    ShapeSpec {
        id: id.into(),
        element_type: "task".into(),
        properties: Default::default(),
        custom_properties: Default::default(),
        position: Point::new(x, 0.0),
        size: Size::new(100.0, 80.0),
        parent: None,
    }
}

fn flow(id: &str, source: &str, target: &str) -> ConnectionSpec {
    ConnectionSpec {
        id: id.into(),
        element_type: "flow".into(),
        properties: Default::default(),
        custom_properties: Default::default(),
        source: source.into(),
        target: target.into(),
        waypoints: Vec::new(),
        parent: None,
    }
}

fn rename(name: &str) -> PropertyPatch {
    let mut patch = PropertyPatch::new();
    patch.insert("name".into(), Some(name.into()));
    patch
}

fn name_of(engine: &SyncEngine<MemoryModel>, id: &str) -> Option<String> {
    engine
        .model()
        .element(id)?
        .business_object
        .get("name")?
        .as_str()
        .map(String::from)
}

struct Cluster {
    relay: MemoryRelay,
    maps: Vec<YrsSharedMap>,
}

impl Cluster {
    fn new(names: &[&str]) -> Self {
        let relay = MemoryRelay::new();
        let maps: Vec<YrsSharedMap> = names.iter().map(|n| YrsSharedMap::new(*n)).collect();
        for map in &maps {
            relay.attach(map).unwrap();
        }
        Self { relay, maps }
    }

    fn engine(&self, index: usize, options: SyncOptions) -> SyncEngine<MemoryModel> {
        SyncEngine::initialize(MemoryModel::new(), Arc::new(self.maps[index].clone()), options).unwrap()
    }
}

#[tokio::test]
async fn test_concurrent_renames_converge() {
    let cluster = Cluster::new(&["a", "b"]);
    let mut a = cluster.engine(0, options("a"));
    let mut b = cluster.engine(1, options("b"));

    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.sync();
    cluster.relay.sync_now();
    b.drain_remote();
    assert!(b.model().contains("s1"));

    // both rename before either sees the other
    a.edit(|m| m.update_properties("s1", &rename("Approve order"))).unwrap();
    b.edit(|m| m.update_properties("s1", &rename("Review order"))).unwrap();
    a.sync();
    b.sync();

    cluster.relay.sync_now();
    a.drain_remote();
    b.drain_remote();
    cluster.relay.sync_now();
    a.drain_remote();
    b.drain_remote();

    let name_a = name_of(&a, "s1").unwrap();
    let name_b = name_of(&b, "s1").unwrap();
    assert_eq!(name_a, name_b);
    assert!(name_a == "Approve order" || name_a == "Review order");

    let registry = a.adapter().registry();
    assert_eq!(registry["s1"].business_object["name"], name_a.as_str());

    // merged state is the new baseline on both sides
    assert!(a.sync().diff_id.is_none());
    assert!(b.sync().diff_id.is_none());
}

#[tokio::test]
async fn test_concurrent_edits_of_different_fields_both_survive() {
    let cluster = Cluster::new(&["a", "b"]);
    let mut a = cluster.engine(0, options("a"));
    let mut b = cluster.engine(1, options("b"));

    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.sync();
    cluster.relay.sync_now();
    b.drain_remote();

    a.edit(|m| m.move_to("s1", Point::new(300.0, 300.0))).unwrap();
    b.edit(|m| m.update_properties("s1", &rename("Renamed"))).unwrap();
    a.sync();
    b.sync();

    for _ in 0..2 {
        cluster.relay.sync_now();
        a.drain_remote();
        b.drain_remote();
    }

    for engine in [&a, &b] {
        let el = engine.model().element("s1").unwrap();
        assert_eq!((el.x, el.y), (Some(300.0), Some(300.0)), "move lost on {}", engine.client_id());
        assert_eq!(name_of(engine, "s1").as_deref(), Some("Renamed"), "rename lost on {}", engine.client_id());
    }
    assert!(a.state().unwrap().same_content(&b.state().unwrap()));

    let registry = b.adapter().registry();
    assert_eq!(registry["s1"].position(), Some(Point::new(300.0, 300.0)));
    assert_eq!(registry["s1"].business_object["name"], "Renamed");

    assert!(a.sync().diff_id.is_none());
    assert!(b.sync().diff_id.is_none());
}

#[tokio::test]
async fn test_concurrent_remove_and_modify_converge() {
    let cluster = Cluster::new(&["a", "b"]);
    let mut a = cluster.engine(0, options("a"));
    let mut b = cluster.engine(1, options("b"));

    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.edit(|m| m.create_shape(shape("s2", 200.0))).unwrap();
    a.sync();
    cluster.relay.sync_now();
    b.drain_remote();

    a.edit(|m| m.move_to("s1", Point::new(40.0, 40.0))).unwrap();
    b.edit(|m| m.remove("s1")).unwrap();
    a.sync();
    b.sync();

    for _ in 0..2 {
        cluster.relay.sync_now();
        a.drain_remote();
        b.drain_remote();
    }

    let state_a = a.state().unwrap();
    let state_b = b.state().unwrap();
    assert!(state_a.same_content(&state_b));
    assert!(a.model().contains("s2"));
    assert_eq!(a.model().contains("s1"), cluster.maps[0].get("element:s1").is_some());
}

#[tokio::test]
async fn test_remote_changes_are_not_sent_back() {
    let cluster = Cluster::new(&["a", "b"]);
    let mut a = cluster.engine(0, options("a"));
    let mut b = cluster.engine(1, options("b"));

    let echoes = Arc::new(Mutex::new(0));
    let counter = echoes.clone();
    b.on(EngineEventKind::LocalSync, move |_| *counter.lock() += 1);

    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.edit(|m| m.create_shape(shape("s2", 200.0))).unwrap();
    a.edit(|m| m.create_connection(flow("c1", "s1", "s2"))).unwrap();
    a.sync();
    for step in 0..5 {
        a.edit(|m| m.move_to("s1", Point::new(10.0 * (step + 1) as f64, 0.0))).unwrap();
        a.sync();
        cluster.relay.sync_now();
        b.drain_remote();
        b.take_local_events();
        b.sync();
    }

    assert_eq!(b.model().len(), 3);
    assert_eq!(*echoes.lock(), 0);
    assert_eq!(b.adapter().stats().sent, 0);
    assert_eq!(a.metrics().remote_syncs, 0);
    assert!(a.state().unwrap().same_content(&b.state().unwrap()));
}

#[tokio::test]
async fn test_late_joiner_replays_retained_diffs() {
    let cluster = Cluster::new(&["a", "b"]);
    let no_registry = |id: &str| SyncOptions {
        element_registry: false,
        ..options(id)
    };
    let mut a = cluster.engine(0, no_registry("a"));

    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.edit(|m| m.create_shape(shape("s2", 200.0))).unwrap();
    a.sync();
    a.edit(|m| m.create_connection(flow("c1", "s1", "s2"))).unwrap();
    a.edit(|m| m.create_shape(shape("s3", 400.0))).unwrap();
    a.sync();
    a.edit(|m| m.remove("s3")).unwrap();
    a.sync();
    cluster.relay.sync_now();

    let mut b = cluster.engine(1, no_registry("b"));
    assert_eq!(b.model().len(), 3);
    assert!(b.model().contains("c1"));
    assert!(!b.model().contains("s3"));
    assert!(a.state().unwrap().same_content(&b.state().unwrap()));
    assert!(b.sync().diff_id.is_none());
}

#[tokio::test]
async fn test_local_content_is_shared_on_first_sync() {
    let cluster = Cluster::new(&["a", "b"]);
    let mut model = MemoryModel::new();
    model.create_shape(shape("s1", 0.0)).unwrap();
    let mut a = SyncEngine::initialize(model, Arc::new(cluster.maps[0].clone()), options("a")).unwrap();
    let mut b = cluster.engine(1, options("b"));

    assert!(a.sync().diff_id.is_some());
    cluster.relay.sync_now();
    b.drain_remote();
    assert!(b.model().contains("s1"));
}

#[tokio::test(start_paused = true)]
async fn test_connection_before_endpoints_is_retried() {
    let cluster = Cluster::new(&["a"]);
    let mut a = cluster.engine(0, options("a"));
    a.edit(|m| m.create_shape(shape("s1", 0.0))).unwrap();
    a.edit(|m| m.create_shape(shape("s2", 200.0))).unwrap();
    a.sync();
    a.edit(|m| m.create_connection(flow("c1", "s1", "s2"))).unwrap();
    a.sync();
    let diffs = a.adapter().retained_diffs();
    assert_eq!(diffs.len(), 2);

    // an isolated replica receiving the diffs out of order
    let lone = YrsSharedMap::new("c");
    let mut c = SyncEngine::initialize(
        MemoryModel::new(),
        Arc::new(lone),
        SyncOptions {
            element_registry: false,
            catch_up: false,
            ..options("c")
        },
    )
    .unwrap();

    let first = c.apply_remote(diffs[1].clone());
    assert!(first.success);
    assert_eq!(first.deferred, 1);
    assert!(!c.model().contains("c1"));

    c.apply_remote(diffs[0].clone());
    assert!(c.retry_pending().applied_changes == 0);

    tokio::time::advance(Duration::from_millis(500)).await;
    let retried = c.retry_pending();
    assert_eq!(retried.applied_changes, 1);
    assert!(c.model().contains("c1"));
    assert!(c.next_retry_due().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_running_replicas_converge() {
    let cluster = Cluster::new(&["a", "b", "c"]);
    cluster.relay.start(Duration::from_millis(20));

    let opts = |id: &str| SyncOptions::new(id);
    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, id)| cluster.engine(i, opts(id)).start())
        .collect();

    handles[0].edit(|m| m.create_shape(shape("s1", 0.0))).await.unwrap().unwrap();
    handles[1].edit(|m| m.create_shape(shape("s2", 200.0))).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    handles[2]
        .edit(|m| m.create_connection(flow("c1", "s1", "s2")))
        .await
        .unwrap()
        .unwrap();
    handles[0].edit(|m| m.update_properties("s2", &rename("Ship"))).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut states = Vec::new();
    for handle in &handles {
        states.push(handle.state().await.unwrap().unwrap());
    }
    assert_eq!(states[0].len(), 3);
    assert!(states[0].same_content(&states[1]));
    assert!(states[0].same_content(&states[2]));

    for handle in handles {
        let model = handle.destroy().await.unwrap();
        assert_eq!(model.len(), 3);
    }
    cluster.relay.stop();
}
