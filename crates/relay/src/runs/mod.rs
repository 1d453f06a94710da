//! Run orchestration.
//!
//! [`RunService`] drives one graph invocation per run:
//!
//! ```text
//!  start_stream ──► thread busy, run running
//!        │
//!        ├── producer task: graph events ──translate──► queue
//!        │                  root values   ──persist───► store
//!        │
//!        └── drain task:    queue ──► caller stream
//!                           terminal ──► run/thread final status, queue removal
//! ```
//!
//! The drain task always reads to the terminal event, even after the caller
//! went away, so status transitions happen exactly once per run.

mod error;
mod translate;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use log::{debug, error, info, warn};
use relay_protocol::events::METADATA;
use relay_protocol::{
    CancelAction, EventMessage, Metadata, OnDisconnect, Run, RunConfig, RunCreate, RunPatch,
    RunStatus, RunStreamPayload, StreamMode, TerminalKind, ThreadPatch, ThreadStatus,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::{EngineError, Graph, GraphRegistry, StreamOptions};
use crate::queue::{EventStream, QueueError, QueueManager, ReadFrom, StreamQueue};
use crate::store::{StoreError, ThreadStore};

pub use error::{RunError, RunResult};
pub use translate::{INTERRUPT_KEY, Persist, StreamTranslator, engine_modes, namespaced};

/// Reason recorded when a client cancels a run.
pub const CANCEL_REASON: &str = "user cancel this run";

/// Reason recorded when a disconnecting client takes its run down with it.
pub const DISCONNECT_REASON: &str = "client disconnected";

/// Error name reported when a graph panics mid-run.
pub const PANIC_ERROR: &str = "PanicError";

/// Every run is a single attempt.
const ATTEMPT: u32 = 1;

/// Upper bound for `cancel_run(wait = true)`.
const CANCEL_WAIT: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 64;

/// Events delivered to one HTTP consumer.
pub type RunStream = BoxStream<'static, RunResult<EventMessage>>;

/// How a run's event stream ended, as seen by its drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Terminal(TerminalKind),
    /// The reader failed or stopped without a terminal event.
    Broken,
}

/// Starts, joins and cancels runs.
pub struct RunService {
    store: Arc<dyn ThreadStore>,
    queues: Arc<QueueManager>,
    graphs: Arc<GraphRegistry>,
    /// Completion signal per run with a live drain task.
    active: DashMap<String, watch::Receiver<bool>>,
}

impl RunService {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        queues: Arc<QueueManager>,
        graphs: Arc<GraphRegistry>,
    ) -> Self {
        Self {
            store,
            queues,
            graphs,
            active: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn graphs(&self) -> &Arc<GraphRegistry> {
        &self.graphs
    }

    /// Whether a drain task is still running for `run_id`.
    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.contains_key(run_id)
    }

    /// Create a run on `thread_id` and stream it.
    pub async fn start_stream(
        self: &Arc<Self>,
        thread_id: &str,
        payload: RunStreamPayload,
    ) -> RunResult<(Run, RunStream)> {
        let thread = self.store.get(thread_id).await?;
        let graph = self.graphs.get(&payload.assistant_id)?;

        if thread.graph_id().is_none() {
            let mut metadata = thread.metadata.clone();
            metadata.insert("graph_id".into(), json!(payload.assistant_id));
            self.store
                .set(
                    thread_id,
                    ThreadPatch {
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let run = self
            .store
            .create_run(
                thread_id,
                &payload.assistant_id,
                RunCreate {
                    metadata: payload.metadata.clone(),
                    multitask_strategy: payload.multitask_strategy,
                },
            )
            .await?;
        info!(
            "run {} created on thread {} (graph {})",
            run.run_id, thread_id, payload.assistant_id
        );

        let stream = self.stream_state(run.clone(), graph, payload).await?;
        Ok((run, stream))
    }

    /// Execute `run` and return the caller's view of its events.
    pub async fn stream_state(
        self: &Arc<Self>,
        run: Run,
        graph: Arc<dyn Graph>,
        payload: RunStreamPayload,
    ) -> RunResult<RunStream> {
        self.store
            .set(&run.thread_id, ThreadPatch::status(ThreadStatus::Busy))
            .await?;

        let opened = self.open(&run).await;
        let (run, queue, subscription) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.abort(&run).await;
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        self.active.insert(run.run_id.clone(), done_rx);

        let on_disconnect = payload.on_disconnect;
        tokio::spawn(produce(
            Arc::clone(&self.store),
            queue,
            graph,
            run.clone(),
            payload,
        ));

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .drain(run, subscription, tx, on_disconnect, done_tx)
                .await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn open(&self, run: &Run) -> RunResult<(Run, Arc<dyn StreamQueue>, EventStream)> {
        let run = self
            .store
            .update_run(&run.run_id, RunPatch::status(RunStatus::Running))
            .await?;
        let queue = self.queues.create_queue(&run.run_id).await?;
        let subscription = queue.subscribe(ReadFrom::Tail).await?;
        Ok((run, queue, subscription))
    }

    /// Undo a start that failed before any task was spawned.
    async fn abort(&self, run: &Run) {
        if let Err(e) = self
            .store
            .update_run(&run.run_id, RunPatch::status(RunStatus::Error))
            .await
        {
            warn!("run {}: marking failed start: {e}", run.run_id);
        }
        if let Err(e) = self
            .store
            .set(&run.thread_id, ThreadPatch::status(ThreadStatus::Idle))
            .await
        {
            warn!("thread {}: resetting after failed start: {e}", run.thread_id);
        }
    }

    async fn drain(
        self: Arc<Self>,
        run: Run,
        mut subscription: EventStream,
        tx: mpsc::Sender<RunResult<EventMessage>>,
        on_disconnect: OnDisconnect,
        done: watch::Sender<bool>,
    ) {
        let mut connected = true;
        let mut outcome = Outcome::Broken;

        loop {
            let item = if connected && on_disconnect == OnDisconnect::Cancel {
                tokio::select! {
                    item = subscription.next() => item,
                    _ = tx.closed() => {
                        connected = false;
                        info!("run {}: client disconnected, cancelling", run.run_id);
                        self.cancel_queue(&run.run_id, DISCONNECT_REASON).await;
                        continue;
                    }
                }
            } else {
                subscription.next().await
            };

            let Some(item) = item else {
                break;
            };

            match item {
                Ok(message) => {
                    let terminal = message.terminal_kind();
                    if connected && tx.send(Ok(message)).await.is_err() {
                        debug!("run {}: consumer gone, draining to completion", run.run_id);
                        connected = false;
                    }
                    if let Some(kind) = terminal {
                        outcome = Outcome::Terminal(kind);
                        break;
                    }
                }
                Err(e) => {
                    error!("run {}: reading queue failed: {e}", run.run_id);
                    if connected {
                        let _ = tx.send(Err(e.into())).await;
                    }
                    break;
                }
            }
        }

        self.finish(&run, outcome).await;
        self.active.remove(&run.run_id);
        let _ = done.send(true);
    }

    async fn finish(&self, run: &Run, outcome: Outcome) {
        let run_id = &run.run_id;
        let result: Result<(), StoreError> = async {
            match outcome {
                Outcome::Terminal(TerminalKind::End) => {
                    self.store
                        .update_run(run_id, RunPatch::status(RunStatus::Success))
                        .await?;
                }
                Outcome::Terminal(TerminalKind::Cancel) => {
                    self.store
                        .update_unfinished_run(run_id, RunPatch::status(RunStatus::Interrupted))
                        .await?;
                }
                Outcome::Terminal(TerminalKind::Error) | Outcome::Broken => {
                    self.store
                        .update_run(run_id, RunPatch::status(RunStatus::Error))
                        .await?;
                    self.store
                        .set(&run.thread_id, ThreadPatch::status(ThreadStatus::Error))
                        .await?;
                }
            }
            self.store
                .set(&run.thread_id, ThreadPatch::status(ThreadStatus::Idle))
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!("run {run_id}: finished ({outcome:?})"),
            Err(e) => error!("run {run_id}: recording final status failed: {e}"),
        }
        self.queues.remove_queue(run_id);
    }

    async fn cancel_queue(&self, run_id: &str, reason: &str) {
        if let Err(e) = self.queues.cancel_queue(run_id, reason).await {
            warn!("run {run_id}: cancel failed: {e}");
        }
    }

    /// Cancel a run. With `wait`, returns once its final status is recorded.
    ///
    /// `rollback` is accepted but behaves like `interrupt`: the state written
    /// so far is kept.
    pub async fn cancel_run(
        &self,
        thread_id: &str,
        run_id: &str,
        wait: bool,
        action: CancelAction,
    ) -> RunResult<Run> {
        let run = self.run_in_thread(thread_id, run_id).await?;
        if action == CancelAction::Rollback {
            debug!("run {run_id}: rollback requested, cancelling as interrupt");
        }

        let done = self.active.get(run_id).map(|entry| entry.value().clone());
        self.queues.cancel_queue(run_id, CANCEL_REASON).await?;

        // The run may have finished while the cancel was in flight.
        let run = self
            .store
            .update_unfinished_run(&run.run_id, RunPatch::status(RunStatus::Interrupted))
            .await?;

        if wait {
            if let Some(mut done) = done {
                if tokio::time::timeout(CANCEL_WAIT, done.wait_for(|finished| *finished))
                    .await
                    .is_err()
                {
                    warn!("run {run_id}: still running {CANCEL_WAIT:?} after cancel");
                }
            }
            return Ok(self.store.get_run(run_id).await?);
        }
        Ok(run)
    }

    /// Attach to a run's queue.
    ///
    /// Without `last_event_id` the reader starts at the live tail; with one it
    /// resumes after that position. A run whose queue is already gone yields a
    /// single end event. `stream_mode` narrows the forwarded events; metadata
    /// and terminal events always pass.
    pub async fn join_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        last_event_id: Option<&str>,
        cancel_on_disconnect: bool,
        stream_mode: Option<StreamMode>,
    ) -> RunResult<RunStream> {
        self.run_in_thread(thread_id, run_id).await?;

        let queue = match self.queues.get_queue(run_id) {
            Ok(queue) => queue,
            Err(QueueError::NotFound(_)) => {
                debug!("run {run_id}: joined after its queue was removed");
                return Ok(futures::stream::iter([Ok(EventMessage::end())]).boxed());
            }
            Err(e) => return Err(e.into()),
        };
        let mut subscription = queue.subscribe(ReadFrom::resume(last_event_id)).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let queues = Arc::clone(&self.queues);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = subscription.next() => item,
                    _ = tx.closed() => {
                        if cancel_on_disconnect {
                            info!("run {run_id}: joined client disconnected, cancelling");
                            if let Err(e) = queues.cancel_queue(&run_id, DISCONNECT_REASON).await {
                                warn!("run {run_id}: cancel failed: {e}");
                            }
                        }
                        break;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                let item = item.map_err(RunError::from);
                if let Ok(message) = &item {
                    if !passes(stream_mode, message) {
                        continue;
                    }
                }
                let last = item.as_ref().map_or(true, EventMessage::is_terminal);
                if tx.send(item).await.is_err() || last {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn run_in_thread(&self, thread_id: &str, run_id: &str) -> RunResult<Run> {
        let run = self.store.get_run(run_id).await?;
        if run.thread_id != thread_id {
            return Err(RunError::NotInThread {
                run_id: run_id.to_string(),
                thread_id: thread_id.to_string(),
            });
        }
        Ok(run)
    }
}

/// Whether a joined reader asking for `mode` should see `message`.
fn passes(mode: Option<StreamMode>, message: &EventMessage) -> bool {
    let Some(mode) = mode else {
        return true;
    };
    if message.is_terminal() || message.event == METADATA {
        return true;
    }
    let family = message
        .base_event()
        .split_once('/')
        .map_or(message.base_event(), |(family, _)| family);
    match mode {
        StreamMode::MessagesTuple => family == StreamMode::Messages.as_str(),
        mode => family == mode.as_str(),
    }
}

/// Config handed to the graph: the caller's config with this thread's ids.
fn run_config(payload: &RunStreamPayload, thread_id: &str) -> RunConfig {
    let mut config = payload.config.clone().unwrap_or_default();
    config
        .configurable
        .entry("graph_id")
        .or_insert_with(|| json!(payload.assistant_id));
    config
        .configurable
        .insert("thread_id".into(), json!(thread_id));
    config
}

/// Producer task body: run the graph into the queue and push the terminal event.
async fn produce(
    store: Arc<dyn ThreadStore>,
    queue: Arc<dyn StreamQueue>,
    graph: Arc<dyn Graph>,
    run: Run,
    payload: RunStreamPayload,
) {
    // A panicking graph must still end the queue, or the drain waits forever.
    let pumped = AssertUnwindSafe(pump(&store, queue.as_ref(), graph.as_ref(), &run, payload))
        .catch_unwind()
        .await;
    let terminal = match pumped {
        Ok(Ok(())) => Some(EventMessage::end()),
        Ok(Err(e)) if e.is_cancelled() || queue.is_cancelled() => {
            debug!("run {}: producer stopped by cancel", run.run_id);
            None
        }
        Ok(Err(e)) => {
            warn!("run {}: producer failed: {e}", run.run_id);
            Some(EventMessage::error(e.event_name(), e.to_string()))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("run {}: producer panicked: {message}", run.run_id);
            Some(EventMessage::error(PANIC_ERROR, message))
        }
    };

    if let Some(terminal) = terminal {
        if let Err(e) = queue.push(terminal).await {
            error!("run {}: pushing terminal event failed: {e}", run.run_id);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "graph panicked".to_string()
    }
}

async fn pump(
    store: &Arc<dyn ThreadStore>,
    queue: &dyn StreamQueue,
    graph: &dyn Graph,
    run: &Run,
    payload: RunStreamPayload,
) -> RunResult<()> {
    let cancel = queue.cancellation_token();
    let config = run_config(&payload, &run.thread_id);
    let graph_id = config
        .configurable
        .get("graph_id")
        .cloned()
        .unwrap_or_else(|| json!(run.assistant_id));

    queue
        .push(EventMessage::new(
            METADATA,
            json!({ "run_id": run.run_id, "attempt": ATTEMPT, "graph_id": graph_id }),
        ))
        .await?;

    let mut metadata = run.metadata.clone();
    metadata.insert("run_attempt".into(), json!(ATTEMPT));

    let options = StreamOptions {
        run_id: run.run_id.clone(),
        input: payload.input,
        command: payload.command,
        config,
        stream_modes: engine_modes(&payload.stream_mode),
        subgraphs: payload.stream_subgraphs,
        interrupt_before: payload.interrupt_before,
        interrupt_after: payload.interrupt_after,
        metadata,
        cancel: cancel.clone(),
    };

    let mut events = graph.stream(options).await?;
    let mut translator = StreamTranslator::new(&payload.stream_mode);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
            event = events.next() => event,
        };
        let Some(event) = event else {
            return Ok(());
        };

        let translated = translator.translate(event?);
        for message in translated.messages {
            queue.push(message).await?;
        }
        match translated.persist {
            Some(Persist::Values(values)) => {
                store
                    .set(&run.thread_id, ThreadPatch::values(values))
                    .await?;
            }
            Some(Persist::Interrupts(value)) => {
                store
                    .set(&run.thread_id, ThreadPatch::interrupts(as_object(value)))
                    .await?;
            }
            None => {}
        }
    }
}

fn as_object(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Metadata::new();
            map.insert(INTERRUPT_KEY.into(), other);
            map
        }
    }
}
