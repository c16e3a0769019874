use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use plume_common::{AiRequest, AiResponse, CallerContext, PoolConfig, ResponseMetadata};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::PoolError;
use crate::privacy::PrivacyRouter;
use crate::protocol::{WorkerInbound, WorkerOutbound};
use crate::worker::{Executor, Worker, WorkerEvent, WorkerStatus};

/// Upper bound on waiting for one context thread to join at shutdown. A
/// context stuck inside a provider call cannot be interrupted; shutdown
/// reports it and moves on rather than hanging.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// A progress frame emitted by an execution context, surfaced to observers.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub request_id: String,
    pub worker_index: usize,
    pub progress: Value,
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub generation: u64,
    pub status: WorkerStatus,
    pub assigned: usize,
}

#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub pending: usize,
    pub shutting_down: bool,
}

enum Command {
    Dispatch {
        request: AiRequest,
        responder: oneshot::Sender<Result<AiResponse, PoolError>>,
    },
    Snapshot {
        responder: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Bookkeeping for one dispatched request, from dispatch until its single
/// terminal event (response, error, timeout, or shutdown rejection).
struct PendingRequest {
    responder: oneshot::Sender<Result<AiResponse, PoolError>>,
    timeout: AbortHandle,
    worker_index: usize,
    provider: Option<String>,
    started_at: Instant,
}

/// Handle to the AI worker pool. Cheap to clone; all state lives in the
/// supervisor task, which exclusively owns the pending registry, the
/// round-robin cursor and the execution contexts.
#[derive(Clone)]
pub struct WorkerPool {
    cmd_tx: UnboundedSender<Command>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    privacy: Option<Arc<dyn PrivacyRouter>>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` execution contexts (all live before the
    /// first request is accepted) and start the supervisor. The privacy
    /// router is optional; without it, privacy mode degrades to using the
    /// caller-specified provider unchanged.
    pub fn new(
        config: PoolConfig,
        executor: Arc<dyn Executor>,
        privacy: Option<Arc<dyn PrivacyRouter>>,
    ) -> anyhow::Result<Arc<Self>> {
        let num_workers = config.num_workers.max(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            workers.push(Worker::spawn(index, 0, executor.clone(), event_tx.clone())?);
        }

        tracing::info!(
            num_workers,
            timeout_ms = config.request_timeout_ms,
            privacy_routing = privacy.is_some(),
            "worker pool started"
        );

        let supervisor = Supervisor {
            config,
            executor,
            workers,
            pending: HashMap::new(),
            cursor: 0,
            shutting_down: false,
            event_tx,
            timer_tx,
            progress_tx: progress_tx.clone(),
        };
        tokio::spawn(supervisor.run(cmd_rx, event_rx, timer_rx));

        Ok(Arc::new(Self {
            cmd_tx,
            progress_tx,
            privacy,
        }))
    }

    /// Submit a request to the pool. The returned future settles exactly
    /// once: with the context's response, its reported error, a timeout, or
    /// a shutdown rejection.
    pub async fn process_request(
        &self,
        request: &AiRequest,
        caller: Option<&CallerContext>,
    ) -> Result<AiResponse, PoolError> {
        // Work on a clone; the caller's payload is never mutated.
        let mut request = request.clone();

        if request.use_privacy_mode {
            match (caller.and_then(|c| c.identity()), self.privacy.as_ref()) {
                (Some(identity), Some(router)) => match router.provider_for(identity).await {
                    Ok(provider) => {
                        tracing::debug!(identity, provider = %provider, "privacy provider selected");
                        request.provider = Some(provider);
                    }
                    // Best-effort: a routing failure never fails the request.
                    Err(error) => {
                        tracing::warn!(
                            identity,
                            error = %error,
                            "privacy provider lookup failed, keeping original provider"
                        );
                    }
                },
                _ => {
                    tracing::debug!(
                        kind = %request.kind,
                        "privacy mode without identity or router, keeping original provider"
                    );
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dispatch {
                request,
                responder: tx,
            })
            .map_err(|_| PoolError::ShuttingDown)?;
        rx.await.map_err(|_| PoolError::ShuttingDown)?
    }

    /// Observe progress frames from all execution contexts. Lossy when the
    /// subscriber lags.
    pub fn subscribe_progress(&self) -> BroadcastStream<ProgressEvent> {
        BroadcastStream::new(self.progress_tx.subscribe())
    }

    /// Point-in-time view of worker state and registry depth.
    pub async fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { responder: tx })
            .map_err(|_| PoolError::ShuttingDown)?;
        rx.await.map_err(|_| PoolError::ShuttingDown)
    }

    /// Reject every pending request, terminate every execution context and
    /// return once all terminations have settled. Subsequent
    /// `process_request` calls reject immediately.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { ack: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct Supervisor {
    config: PoolConfig,
    executor: Arc<dyn Executor>,
    workers: Vec<Worker>,
    /// request id → pending bookkeeping. Always agrees with the workers'
    /// assigned sets; both are only touched from this task.
    pending: HashMap<String, PendingRequest>,
    cursor: usize,
    shutting_down: bool,
    event_tx: UnboundedSender<WorkerEvent>,
    timer_tx: UnboundedSender<String>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut cmd_rx: UnboundedReceiver<Command>,
        mut event_rx: UnboundedReceiver<WorkerEvent>,
        mut timer_rx: UnboundedReceiver<String>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // All pool handles are gone; dropping the workers closes
                    // their inboxes and the threads wind down.
                    None => break,
                },
                Some(event) = event_rx.recv() => self.handle_event(event),
                Some(request_id) = timer_rx.recv() => self.handle_timeout(request_id),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dispatch { request, responder } => self.handle_dispatch(request, responder),
            Command::Snapshot { responder } => {
                let _ = responder.send(self.snapshot());
            }
            Command::Shutdown { ack } => self.handle_shutdown(ack),
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            workers: self
                .workers
                .iter()
                .map(|w| WorkerSnapshot {
                    index: w.index,
                    generation: w.generation,
                    status: w.status,
                    assigned: w.assigned.len(),
                })
                .collect(),
            pending: self.pending.len(),
            shutting_down: self.shutting_down,
        }
    }

    fn handle_dispatch(
        &mut self,
        request: AiRequest,
        responder: oneshot::Sender<Result<AiResponse, PoolError>>,
    ) {
        if self.shutting_down {
            let _ = responder.send(Err(PoolError::ShuttingDown));
            return;
        }

        let request_id = Uuid::new_v4().to_string();

        // Strict round-robin: fairness, not load-awareness. Queue depth is
        // never consulted.
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.workers.len();

        let timeout = self.config.request_timeout();
        let timer_tx = self.timer_tx.clone();
        let timer_id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(timer_id);
        });

        let worker = &mut self.workers[index];
        worker.assigned.insert(request_id.clone());
        worker.status = WorkerStatus::Busy;
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                responder,
                timeout: timer.abort_handle(),
                worker_index: index,
                provider: request.provider.clone(),
                started_at: Instant::now(),
            },
        );

        tracing::debug!(
            request_id = %request_id,
            worker = index,
            kind = %request.kind,
            "dispatching request"
        );

        let sent = self.workers[index].send(WorkerInbound::Request {
            request_id: request_id.clone(),
            data: request,
        });
        if sent.is_err() {
            // Context thread is already gone; fail fast instead of letting
            // the timeout fire.
            if let Some(pending) = self.remove_pending(&request_id) {
                let _ = pending.responder.send(Err(PoolError::WorkerFailed {
                    index,
                    reason: "execution context unavailable".to_string(),
                }));
            }
        }
    }

    /// Remove a request from the registry and its owner's assigned set,
    /// cancelling the timeout. The two structures change together, always.
    fn remove_pending(&mut self, request_id: &str) -> Option<PendingRequest> {
        let pending = self.pending.remove(request_id)?;
        pending.timeout.abort();
        if let Some(worker) = self.workers.get_mut(pending.worker_index) {
            worker.assigned.remove(request_id);
            if worker.assigned.is_empty() && worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Ready;
            }
        }
        Some(pending)
    }

    fn handle_timeout(&mut self, request_id: String) {
        // Absent id means a terminal event already fired; the timer lost
        // the race and there is nothing to do.
        let Some(pending) = self.remove_pending(&request_id) else {
            return;
        };
        let timeout_ms = self.config.request_timeout_ms;
        tracing::warn!(
            request_id = %request_id,
            worker = pending.worker_index,
            timeout_ms,
            "request timed out"
        );
        let _ = pending.responder.send(Err(PoolError::Timeout {
            request_id,
            timeout_ms,
        }));
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message {
                index,
                generation,
                msg,
            } => {
                if !self.is_current(index, generation) {
                    tracing::debug!(index, "message from replaced context, dropping");
                    return;
                }
                self.handle_message(index, msg);
            }
            WorkerEvent::Faulted {
                index,
                generation,
                reason,
            } => {
                if !self.is_current(index, generation) {
                    return;
                }
                tracing::error!(index, reason = %reason, "execution context faulted");
                self.replace_worker(index, reason);
            }
            WorkerEvent::Exited {
                index,
                generation,
                code,
            } => {
                if !self.is_current(index, generation) {
                    return;
                }
                if self.shutting_down || code == 0 {
                    tracing::debug!(index, code, "execution context exited");
                    return;
                }
                tracing::error!(index, code, "execution context exited abnormally");
                self.replace_worker(index, format!("exited with code {code}"));
            }
        }
    }

    fn is_current(&self, index: usize, generation: u64) -> bool {
        self.workers
            .get(index)
            .map(|w| w.generation == generation)
            .unwrap_or(false)
    }

    fn handle_message(&mut self, index: usize, msg: WorkerOutbound) {
        match msg {
            WorkerOutbound::Response { request_id, data } => {
                let Some(pending) = self.remove_pending(&request_id) else {
                    // Late or duplicate delivery after a timeout; expected.
                    tracing::debug!(
                        request_id = %request_id,
                        worker = index,
                        "response for unknown request, dropping"
                    );
                    return;
                };
                let result = if data.is_object() {
                    Ok(build_response(data, &request_id, index, &pending))
                } else {
                    tracing::warn!(
                        request_id = %request_id,
                        worker = index,
                        "malformed response payload from execution context"
                    );
                    Err(PoolError::Protocol(format!(
                        "response payload for {request_id} is not an object"
                    )))
                };
                let _ = pending.responder.send(result);
            }
            WorkerOutbound::Error { request_id, error } => {
                let Some(pending) = self.remove_pending(&request_id) else {
                    tracing::debug!(
                        request_id = %request_id,
                        worker = index,
                        "error for unknown request, dropping"
                    );
                    return;
                };
                tracing::debug!(request_id = %request_id, worker = index, error = %error, "execution error");
                let _ = pending.responder.send(Err(PoolError::Execution(error)));
            }
            WorkerOutbound::Progress {
                request_id,
                progress,
            } => {
                // Informational; the pending entry is not retired.
                let _ = self.progress_tx.send(ProgressEvent {
                    request_id,
                    worker_index: index,
                    progress,
                });
            }
        }
    }

    /// Contained failure: reject everything the dead context owned, then
    /// stand up a fresh context at the same index. Pool size is invariant,
    /// so round-robin indexing stays valid.
    fn replace_worker(&mut self, index: usize, reason: String) {
        let assigned: Vec<String> = self.workers[index].assigned.drain().collect();
        for request_id in &assigned {
            if let Some(pending) = self.pending.remove(request_id) {
                pending.timeout.abort();
                let _ = pending.responder.send(Err(PoolError::WorkerFailed {
                    index,
                    reason: reason.clone(),
                }));
            }
        }
        self.workers[index].status = WorkerStatus::Error;

        let generation = self.workers[index].generation + 1;
        let spawned = Worker::spawn(index, generation, self.executor.clone(), self.event_tx.clone())
            .or_else(|error| {
                // A dead context must be replaced, never left dangling;
                // give a transient spawn failure one more chance.
                tracing::warn!(index, error = %error, "execution context spawn failed, retrying");
                Worker::spawn(index, generation, self.executor.clone(), self.event_tx.clone())
            });
        match spawned {
            Ok(replacement) => {
                // Dropping the old worker closes its inbox; the thread (if
                // still alive) winds down on its own. It cannot be killed
                // mid-execution.
                let old = std::mem::replace(&mut self.workers[index], replacement);
                drop(old);
                tracing::info!(
                    index,
                    generation,
                    rejected = assigned.len(),
                    "execution context replaced"
                );
            }
            Err(error) => {
                tracing::error!(index, error = %error, "failed to replace execution context");
            }
        }
    }

    fn handle_shutdown(&mut self, ack: oneshot::Sender<()>) {
        if self.shutting_down {
            let _ = ack.send(());
            return;
        }
        self.shutting_down = true;

        let ids: Vec<String> = self.pending.keys().cloned().collect();
        tracing::info!(pending = ids.len(), "pool shutting down");
        for request_id in ids {
            if let Some(pending) = self.remove_pending(&request_id) {
                let _ = pending.responder.send(Err(PoolError::ShuttingDown));
            }
        }

        let mut handles = Vec::new();
        for worker in &mut self.workers {
            let _ = worker.send(WorkerInbound::Shutdown);
            if let Some(handle) = worker.take_handle() {
                handles.push((worker.index, handle));
            }
        }

        // Join off the supervisor task so dispatches arriving during
        // shutdown still get their fast rejection.
        tokio::spawn(async move {
            for (index, handle) in handles {
                let join = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(JOIN_TIMEOUT, join).await {
                    Ok(Ok(Ok(()))) => tracing::debug!(index, "execution context terminated"),
                    Ok(Ok(Err(_))) => {
                        tracing::warn!(index, "execution context terminated with panic")
                    }
                    Ok(Err(error)) => tracing::warn!(index, error = %error, "join task failed"),
                    Err(_) => {
                        tracing::warn!(index, "execution context did not terminate in time")
                    }
                }
            }
            let _ = ack.send(());
        });
    }
}

fn build_response(data: Value, request_id: &str, index: usize, pending: &PendingRequest) -> AiResponse {
    let duration_ms = pending.started_at.elapsed().as_millis() as u64;
    AiResponse {
        content: data
            .get("content")
            .and_then(|v| v.as_str())
            .map(String::from),
        success: data
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| data.get("error").is_none()),
        stop_reason: data
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
        tool_calls: data.get("tool_calls").and_then(|v| v.as_array()).cloned(),
        error: data.get("error").and_then(|v| v.as_str()).map(String::from),
        metadata: ResponseMetadata {
            provider: data
                .get("provider")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| pending.provider.clone()),
            worker_index: index,
            request_id: request_id.to_string(),
            processed_at: Utc::now(),
            duration_ms,
        },
    }
}
