//! Two Replicas Example
//!
//! Two engines editing one diagram through a relayed shared document.
//!
//! Run with: cargo run --example two_replicas

use std::sync::Arc;
use std::time::Duration;

use dsync_core::{DiagramModel, MemoryModel, Point, PropertyPatch, ShapeSpec, Size};
use dsync_engine::{EngineEvent, EngineEventKind, SyncEngine, SyncOptions};
use dsync_transport::{MemoryRelay, YrsSharedMap};

fn task(id: &str, x: f64, name: &str) -> ShapeSpec {
    let mut properties = dsync_core::PropertyMap::new();
    properties.insert("name".into(), name.into());
    ShapeSpec {
        id: id.into(),
        element_type: "task".into(),
        properties,
        custom_properties: Default::default(),
        position: Point::new(x, 100.0),
        size: Size::new(100.0, 80.0),
        parent: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("DSync Two Replicas Example\n");

    println!("=== Manual Mode ===\n");
    manual_example()?;

    println!("\n=== Running Mode ===\n");
    running_example().await?;

    Ok(())
}

/// Drive both engines by hand: sync, exchange, apply
fn manual_example() -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    let map_a = YrsSharedMap::new("alice");
    let map_b = YrsSharedMap::new("bob");
    relay.attach(&map_a)?;
    relay.attach(&map_b)?;

    let mut alice = SyncEngine::initialize(MemoryModel::new(), Arc::new(map_a), SyncOptions::new("alice"))?;
    let mut bob = SyncEngine::initialize(MemoryModel::new(), Arc::new(map_b), SyncOptions::new("bob"))?;

    alice.on(EngineEventKind::LocalSync, |event| {
        if let EngineEvent::LocalSync { diff, .. } = event {
            println!("alice sent {} change(s)", diff.change_count());
        }
    });

    alice.edit(|m| m.create_shape(task("receive", 0.0, "Receive order")))?;
    alice.edit(|m| m.create_shape(task("check", 200.0, "Check stock")))?;
    alice.sync();
    relay.sync_now();

    for result in bob.drain_remote() {
        println!("bob applied {} change(s)", result.applied_changes);
    }
    println!("bob sees {} element(s)", bob.model().len());

    let mut patch = PropertyPatch::new();
    patch.insert("name".into(), Some("Verify stock".into()));
    bob.edit(|m| m.update_properties("check", &patch))?;
    bob.sync();
    relay.sync_now();
    alice.drain_remote();

    let check = alice.model().element("check").ok_or("check missing")?;
    println!("alice sees check renamed to {}", check.business_object["name"]);

    alice.destroy();
    bob.destroy();
    Ok(())
}

/// Let each engine run as its own task
async fn running_example() -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    let maps = [YrsSharedMap::new("alice"), YrsSharedMap::new("bob")];
    for map in &maps {
        relay.attach(map)?;
    }
    relay.start(Duration::from_millis(20));

    let alice = SyncEngine::initialize(MemoryModel::new(), Arc::new(maps[0].clone()), SyncOptions::new("alice"))?.start();
    let bob = SyncEngine::initialize(MemoryModel::new(), Arc::new(maps[1].clone()), SyncOptions::new("bob"))?.start();

    alice.edit(|m| m.create_shape(task("ship", 0.0, "Ship order"))).await??;
    bob.edit(|m| m.create_shape(task("bill", 200.0, "Send invoice"))).await??;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let a = alice.state().await?.ok_or("alice has no state")?;
    let b = bob.state().await?.ok_or("bob has no state")?;
    println!("alice: {} element(s), bob: {} element(s)", a.len(), b.len());
    println!("converged: {}", a.same_content(&b));

    println!("alice metrics: {:?}", alice.metrics().await?);

    alice.destroy().await?;
    bob.destroy().await?;
    relay.stop();
    Ok(())
}
