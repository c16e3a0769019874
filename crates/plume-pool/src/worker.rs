use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use plume_common::AiRequest;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::{WorkerInbound, WorkerOutbound};

/// The opaque unit of computation that runs inside an execution context.
///
/// Implementations talk to LLM providers, build prompts, retry, rate-limit —
/// none of which the pool sees. `execute` runs on a dedicated OS thread and
/// is deliberately synchronous: the context owns its thread for the duration
/// of a request and communicates only through messages.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, request: AiRequest, reporter: &Reporter) -> Result<Value, String>;
}

/// Handed to the executor so it can emit progress frames for a request.
pub struct Reporter {
    request_id: String,
    index: usize,
    generation: u64,
    events: UnboundedSender<WorkerEvent>,
}

impl Reporter {
    pub fn progress(&self, progress: Value) {
        let _ = self.events.send(WorkerEvent::Message {
            index: self.index,
            generation: self.generation,
            msg: WorkerOutbound::Progress {
                request_id: self.request_id.clone(),
                progress,
            },
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Busy,
    Error,
}

/// Events an execution context reports to the pool supervisor. `generation`
/// identifies which incarnation of the slot sent the event, so messages from
/// an already-replaced context are discarded.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        index: usize,
        generation: u64,
        msg: WorkerOutbound,
    },
    Faulted {
        index: usize,
        generation: u64,
        reason: String,
    },
    Exited {
        index: usize,
        generation: u64,
        code: i32,
    },
}

/// One live execution context: an OS thread with a message inbox. Owned
/// exclusively by the pool supervisor; replaced (never mutated in place)
/// when it fails.
pub(crate) struct Worker {
    pub index: usize,
    pub generation: u64,
    pub status: WorkerStatus,
    /// Request ids currently assigned to this context. Must always agree
    /// with the pending registry.
    pub assigned: HashSet<String>,
    inbox: std_mpsc::Sender<WorkerInbound>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        index: usize,
        generation: u64,
        executor: Arc<dyn Executor>,
        events: UnboundedSender<WorkerEvent>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("plume-worker-{index}"))
            .spawn(move || run(index, generation, rx, executor, events))?;

        Ok(Self {
            index,
            generation,
            status: WorkerStatus::Ready,
            assigned: HashSet::new(),
            inbox: tx,
            handle: Some(handle),
        })
    }

    /// Send a message into the context. Fails only when the thread is gone.
    pub fn send(&self, msg: WorkerInbound) -> Result<(), ()> {
        self.inbox.send(msg).map_err(|_| ())
    }

    /// Take the thread handle for joining at shutdown.
    pub fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

fn run(
    index: usize,
    generation: u64,
    inbox: std_mpsc::Receiver<WorkerInbound>,
    executor: Arc<dyn Executor>,
    events: UnboundedSender<WorkerEvent>,
) {
    let code = loop {
        match inbox.recv() {
            Ok(WorkerInbound::Request { request_id, data }) => {
                let reporter = Reporter {
                    request_id: request_id.clone(),
                    index,
                    generation,
                    events: events.clone(),
                };
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| executor.execute(data, &reporter)));
                let msg = match outcome {
                    Ok(Ok(data)) => WorkerOutbound::Response { request_id, data },
                    Ok(Err(error)) => WorkerOutbound::Error { request_id, error },
                    Err(panic) => {
                        let reason = panic_reason(panic);
                        let _ = events.send(WorkerEvent::Faulted {
                            index,
                            generation,
                            reason,
                        });
                        break 1;
                    }
                };
                let _ = events.send(WorkerEvent::Message {
                    index,
                    generation,
                    msg,
                });
            }
            // Explicit shutdown, or the supervisor dropped the inbox.
            Ok(WorkerInbound::Shutdown) | Err(_) => break 0,
        }
    };
    let _ = events.send(WorkerEvent::Exited {
        index,
        generation,
        code,
    });
}

fn panic_reason(err: Box<dyn Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
