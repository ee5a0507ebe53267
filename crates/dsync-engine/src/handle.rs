//! Running an engine as a serial task
//!
//! `SyncEngine::start` moves the engine into one tokio task. Commands,
//! remote diffs, consolidated local edits, deferred retries and the sync
//! timer are all handled by a single `select!` loop, so nothing that reads
//! or writes the model ever interleaves.

use crate::engine::{EngineMetrics, SyncEngine};
use crate::error::{EngineError, EngineResult};
use crate::plugin::{EngineEvent, EngineEventKind};
use dsync_core::{DiagramModel, DocumentState, SyncResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

type EditFn<M> = Box<dyn FnOnce(&mut M) + Send>;

enum Command<M> {
    Sync(oneshot::Sender<SyncResult>),
    Pause,
    Resume,
    SetInterval(Duration, oneshot::Sender<EngineResult<()>>),
    Edit(EditFn<M>),
    Metrics(oneshot::Sender<EngineMetrics>),
    State(oneshot::Sender<Option<Arc<DocumentState>>>),
    On(EngineEventKind, crate::plugin::EngineEventHandler),
    Stop,
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<M: DiagramModel + Send + 'static> SyncEngine<M> {
    /// Run the engine on the current tokio runtime
    pub fn start(self) -> EngineHandle<M> {
        let (commands, rx) = mpsc::unbounded_channel();
        let client_id = self.client_id().to_string();
        let task = tokio::spawn(run(self, rx));
        info!(client_id = %client_id, "Sync engine started");
        EngineHandle {
            client_id,
            commands,
            task: Some(task),
        }
    }
}

async fn run<M: DiagramModel + Send + 'static>(
    mut engine: SyncEngine<M>,
    mut commands: mpsc::UnboundedReceiver<Command<M>>,
) -> SyncEngine<M> {
    let Some(mut remote) = engine.remote_rx.take() else {
        return engine;
    };
    let Some(mut local) = engine.local_rx.take() else {
        engine.remote_rx = Some(remote);
        return engine;
    };
    let mut timer = ticker(engine.sync_interval());

    loop {
        let retry_due = engine.next_retry_due();
        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Sync(reply) => {
                        let _ = reply.send(engine.sync());
                    }
                    Command::Pause => engine.pause(),
                    Command::Resume => {
                        engine.resume();
                        timer.reset();
                    }
                    Command::SetInterval(period, reply) => {
                        let outcome = engine.set_sync_interval(period);
                        if outcome.is_ok() {
                            timer = ticker(engine.sync_interval());
                        }
                        let _ = reply.send(outcome);
                    }
                    Command::Edit(f) => engine.edit(f),
                    Command::Metrics(reply) => {
                        let _ = reply.send(engine.metrics());
                    }
                    Command::State(reply) => {
                        let _ = reply.send(engine.state());
                    }
                    Command::On(kind, handler) => engine.on_shared(kind, handler),
                    Command::Stop => break,
                }
            }

            Some(diff) = remote.recv() => {
                engine.apply_remote(diff);
            }

            Some(_) = local.recv() => {
                let mut burst = 1;
                while local.try_recv().is_ok() {
                    burst += 1;
                }
                if !engine.is_paused() {
                    debug!(client_id = %engine.client_id(), events = burst, "Local edits settled");
                    engine.sync();
                }
            }

            _ = sleep_until_due(retry_due), if retry_due.is_some() => {
                engine.retry_pending();
            }

            _ = timer.tick(), if !engine.is_paused() => {
                engine.sync();
            }
        }
    }

    engine.remote_rx = Some(remote);
    engine.local_rx = Some(local);
    engine
}

/// Talks to a running engine
pub struct EngineHandle<M> {
    client_id: String,
    commands: mpsc::UnboundedSender<Command<M>>,
    task: Option<JoinHandle<SyncEngine<M>>>,
}

impl<M: DiagramModel + Send + 'static> EngineHandle<M> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn send(&self, command: Command<M>) -> EngineResult<()> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<M>) -> EngineResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Run a local sync now, outside the timer
    pub async fn sync(&self) -> EngineResult<SyncResult> {
        self.request(Command::Sync).await
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.send(Command::Resume)
    }

    pub async fn set_interval(&self, period: Duration) -> EngineResult<()> {
        self.request(|tx| Command::SetInterval(period, tx)).await?
    }

    /// Mutate the model inside the engine's task and return what `f` returns
    pub async fn edit<R, F>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&mut M) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Edit(Box::new(move |model: &mut M| {
            let _ = tx.send(f(model));
        })))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn metrics(&self) -> EngineResult<EngineMetrics> {
        self.request(Command::Metrics).await
    }

    pub async fn state(&self) -> EngineResult<Option<Arc<DocumentState>>> {
        self.request(Command::State).await
    }

    pub fn on<F>(&self, kind: EngineEventKind, handler: F) -> EngineResult<()>
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.send(Command::On(kind, Arc::new(handler)))
    }

    /// Stop the loop after the operation in progress and take the engine back
    pub async fn stop(mut self) -> EngineResult<SyncEngine<M>> {
        let _ = self.send(Command::Stop);
        let task = self.task.take().ok_or(EngineError::Stopped)?;
        let engine = task.await.map_err(|_| EngineError::Stopped)?;
        info!(client_id = %self.client_id, "Sync engine stopped");
        Ok(engine)
    }

    /// Stop the loop and destroy the engine, returning the model
    pub async fn destroy(self) -> EngineResult<M> {
        Ok(self.stop().await?.destroy())
    }
}

impl<M> Drop for EngineHandle<M> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<M> std::fmt::Debug for EngineHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("client_id", &self.client_id)
            .field("running", &self.task.as_ref().is_some_and(|t| !t.is_finished()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use dsync_core::{MemoryModel, Point, ShapeSpec, Size};
    use dsync_transport::YrsSharedMap;
    use parking_lot::Mutex;

    fn shape(id: &str) -> ShapeSpec {
        ShapeSpec {
            id: id.into(),
            element_type: "task".into(),
            properties: Default::default(),
            custom_properties: Default::default(),
            position: Point::new(0.0, 0.0),
            size: Size::new(100.0, 80.0),
            parent: None,
        }
    }

    fn start(options: SyncOptions) -> EngineHandle<MemoryModel> {
        let map = YrsSharedMap::new(options.client_id.clone());
        SyncEngine::initialize(MemoryModel::new(), Arc::new(map), options)
            .unwrap()
            .start()
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_triggers_sync_after_debounce() {
        let handle = start(SyncOptions {
            sync_interval_ms: 60_000,
            ..SyncOptions::new("a")
        });
        let synced = Arc::new(Mutex::new(0));
        let counter = synced.clone();
        handle
            .on(EngineEventKind::LocalSync, move |_| *counter.lock() += 1)
            .unwrap();

        handle.edit(|m| m.create_shape(shape("s1"))).await.unwrap().unwrap();
        assert_eq!(*synced.lock(), 0);

        time::sleep(Duration::from_millis(60)).await;
        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.local_syncs, 1);
        assert_eq!(*synced.lock(), 1);
        handle.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_syncs_unless_paused() {
        let handle = start(SyncOptions {
            event_batching: false,
            ..SyncOptions::new("a")
        });
        handle.pause().unwrap();
        handle.edit(|m| m.create_shape(shape("s1"))).await.unwrap().unwrap();
        time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(handle.metrics().await.unwrap().local_syncs, 0);

        handle.resume().unwrap();
        time::sleep(Duration::from_millis(600)).await;
        let metrics = handle.metrics().await.unwrap();
        assert_eq!(metrics.local_syncs, 1);
        assert_eq!(metrics.element_count, 1);
        handle.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sync_and_interval() {
        let handle = start(SyncOptions::new("a"));
        handle.edit(|m| m.create_shape(shape("s1"))).await.unwrap().unwrap();
        let result = handle.sync().await.unwrap();
        assert!(result.diff_id.is_some());

        assert!(handle.set_interval(Duration::ZERO).await.is_err());
        handle.set_interval(Duration::from_millis(100)).await.unwrap();

        let state = handle.state().await.unwrap().unwrap();
        assert!(state.contains("s1"));

        let engine = handle.stop().await.unwrap();
        assert_eq!(engine.sync_interval(), Duration::from_millis(100));
        let model = engine.destroy();
        assert_eq!(model.len(), 1);
    }

    #[tokio::test]
    async fn test_commands_fail_after_stop() {
        let handle = start(SyncOptions::new("a"));
        let commands = handle.commands.clone();
        handle.stop().await.unwrap();
        assert!(commands.send(Command::Pause).is_err());
    }
}
