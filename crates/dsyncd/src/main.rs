//! DSync simulation daemon (dsyncd)
//!
//! Runs several replicas of one diagram, each with its own sync engine,
//! linked through an in-process relay of their shared yrs documents. A
//! scenario of timed edits is replayed against the replicas; once they have
//! settled the daemon prints every replica's snapshot and exits non-zero if
//! any two disagree.
//!
//! # Usage
//!
//! ```bash
//! # Built-in scenario on two replicas
//! dsyncd
//!
//! # Three replicas, custom scenario, metrics on :9464
//! dsyncd --replicas 3 --scenario flows.json --metrics-addr 127.0.0.1:9464
//!
//! # Engine options from a file
//! dsyncd --config /etc/dsync/dsync.toml
//! ```

mod config;
mod scenario;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::time::Instant;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dsync_core::{DocumentState, MemoryModel};
use dsync_engine::{
    EngineEvent, EngineEventKind, EngineHandle, Metrics, MetricsPlugin, MetricsServer, SyncEngine, SyncOptions,
};
use dsync_transport::{MemoryRelay, YrsSharedMap};

use crate::config::FileConfig;
use crate::scenario::{Action, Scenario};

/// DSync daemon - replays edits across relayed replicas and checks convergence
#[derive(Parser, Debug)]
#[command(name = "dsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML, `[engine]` and `[daemon]` tables)
    #[arg(short, long, env = "DSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of replicas (default 2)
    #[arg(short, long, env = "DSYNC_REPLICAS")]
    replicas: Option<usize>,

    /// Scenario file (JSON); the built-in scenario runs when omitted
    #[arg(short, long, env = "DSYNC_SCENARIO")]
    scenario: Option<PathBuf>,

    /// Delay the relay adds to every exchange, in milliseconds (default 20)
    #[arg(long, env = "DSYNC_RELAY_LATENCY_MS")]
    relay_latency_ms: Option<u64>,

    /// Override the scenario's settle period, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "DSYNC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print the first replica's final snapshot as JSON
    #[arg(long)]
    dump: bool,

    /// Keep replicas running after the report until Ctrl-C
    #[arg(long)]
    hold: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let file = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            FileConfig::load(path)?
        }
        None => FileConfig::default(),
    };

    let replicas = args.replicas.or(file.daemon.replicas).unwrap_or(2);
    if replicas == 0 {
        bail!("At least one replica is required");
    }
    let latency = Duration::from_millis(args.relay_latency_ms.or(file.daemon.relay_latency_ms).unwrap_or(20));

    let scenario_path = args.scenario.clone().or_else(|| file.daemon.scenario.clone().map(PathBuf::from));
    let scenario = match &scenario_path {
        Some(path) => Scenario::load(path)?,
        None => Scenario::builtin(replicas),
    };
    scenario.validate(replicas)?;
    let settle = args.settle_ms.map(Duration::from_millis).unwrap_or_else(|| scenario.settle());

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = args.metrics_addr.or(file.daemon.metrics_addr) {
        let server = MetricsServer::new(metrics.clone(), addr);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    // Start replicas
    let relay = MemoryRelay::new();
    let mut maps = Vec::with_capacity(replicas);
    let mut handles = Vec::with_capacity(replicas);
    for i in 0..replicas {
        let client_id = format!("replica-{}", i + 1);
        let map = YrsSharedMap::new(client_id.clone());
        relay.attach(&map)?;

        let options = SyncOptions {
            client_id: client_id.clone(),
            ..file.engine.clone()
        };
        let model = MemoryModel::new().with_author(client_id.clone());
        let mut engine = SyncEngine::initialize(model, Arc::new(map.clone()), options)?;
        engine.register_plugin(Box::new(MetricsPlugin::new(metrics.clone())))?;
        let id = client_id.clone();
        engine.on(EngineEventKind::SyncError, move |event| {
            if let EngineEvent::SyncError { operation, errors } = event {
                for e in errors {
                    warn!(client_id = %id, operation = %operation, error = %e, "Sync error");
                }
            }
        });

        handles.push(engine.start());
        maps.push(map);
    }
    relay.start(latency);

    info!(
        replicas,
        steps = scenario.steps.len(),
        edits = scenario.steps.iter().filter(|s| s.action.is_edit()).count(),
        latency_ms = latency.as_millis() as u64,
        settle_ms = settle.as_millis() as u64,
        "Running scenario"
    );

    run_scenario(&scenario, &handles, &maps).await?;
    tokio::time::sleep(settle).await;

    // Collect and compare
    let mut states = Vec::with_capacity(replicas);
    for handle in &handles {
        let state = handle.state().await?.unwrap_or_else(|| Arc::new(DocumentState::empty(handle.client_id())));
        let m = handle.metrics().await?;
        println!(
            "{:<12} elements={:<4} version={:<5} local_syncs={:<4} remote_syncs={:<4} errors={:<3} connection={}",
            handle.client_id(),
            state.len(),
            state.version,
            m.local_syncs,
            m.remote_syncs,
            m.sync_errors,
            m.connection
        );
        states.push(state);
    }

    let diverged: Vec<&str> = states
        .iter()
        .skip(1)
        .filter(|s| !s.same_content(&states[0]))
        .map(|s| s.client_id.as_str())
        .collect();

    if args.dump {
        let elements: BTreeMap<_, _> = states[0].elements.iter().collect();
        println!("{}", serde_json::to_string_pretty(&elements)?);
    }

    if args.hold {
        info!("Holding replicas; press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down...");
    for handle in handles {
        handle.destroy().await?;
    }
    relay.stop();

    if !diverged.is_empty() {
        bail!("Replicas diverged from {}: {}", states[0].client_id, diverged.join(", "));
    }
    info!(replicas, "All replicas converged");
    Ok(())
}

async fn run_scenario(
    scenario: &Scenario,
    handles: &[EngineHandle<MemoryModel>],
    maps: &[YrsSharedMap],
) -> Result<()> {
    let started = Instant::now();
    for step in &scenario.steps {
        tokio::time::sleep_until(started + Duration::from_millis(step.at_ms)).await;
        let handle = &handles[step.replica];
        match &step.action {
            Action::Disconnect => {
                info!(client_id = %handle.client_id(), "Disconnecting replica");
                maps[step.replica].disconnect();
            }
            Action::Reconnect => {
                info!(client_id = %handle.client_id(), "Reconnecting replica");
                maps[step.replica].reconnect();
            }
            Action::Pause => handle.pause()?,
            Action::Resume => handle.resume()?,
            action => {
                let action = action.clone();
                let description = format!("{:?}", action);
                match handle.edit(move |model| action.apply(model)).await? {
                    Ok(()) => debug!(client_id = %handle.client_id(), step = %description, "Applied scenario step"),
                    Err(e) => warn!(client_id = %handle.client_id(), step = %description, error = %e, "Scenario step failed"),
                }
            }
        }
    }
    Ok(())
}

fn print_banner() {
    println!(
        r#"
  dsyncd - diagram sync simulation
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
