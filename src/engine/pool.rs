//! Fixed-size worker pool.
//!
//! Workers are stateless loops sharing one FIFO assignment queue: whichever
//! worker is free takes the oldest assignment. Every assignment produces
//! exactly one `Finished` report.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::generator::{GenerationRequest, Generator};
use crate::engine::task::GenerationTask;
use crate::errors::{EngineError, TaskError};

/// A task handed to the pool.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub run_id: Uuid,
    pub task: GenerationTask,
    pub request: GenerationRequest,
    pub attempt: u32,
}

#[derive(Debug)]
pub struct WorkerReport {
    pub worker: usize,
    pub run_id: Uuid,
    pub task: GenerationTask,
    pub attempt: u32,
    pub result: Result<String, TaskError>,
    pub elapsed: Duration,
}

/// Messages from workers to the dispatcher loop.
#[derive(Debug)]
pub enum WorkerMessage {
    Started {
        worker: usize,
        run_id: Uuid,
        task: GenerationTask,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Finished(WorkerReport),
}

pub struct WorkerPool {
    size: usize,
    assign_tx: Option<mpsc::UnboundedSender<Assignment>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers reporting on `report_tx`. Each generation call is
    /// bounded by `timeout`.
    pub fn spawn(
        size: usize,
        generator: Arc<dyn Generator>,
        report_tx: mpsc::UnboundedSender<WorkerMessage>,
        timeout: Duration,
    ) -> Self {
        let (assign_tx, assign_rx) = mpsc::unbounded_channel::<Assignment>();
        let queue = Arc::new(Mutex::new(assign_rx));

        let handles = (0..size)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let generator = Arc::clone(&generator);
                let report_tx = report_tx.clone();
                tokio::spawn(worker_loop(worker, queue, generator, report_tx, timeout))
            })
            .collect();

        Self {
            size,
            assign_tx: Some(assign_tx),
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn assign(&self, assignment: Assignment) -> Result<(), EngineError> {
        let tx = self.assign_tx.as_ref().ok_or(EngineError::ShutDown)?;
        tx.send(assignment).map_err(|_| EngineError::ShutDown)
    }

    /// Close the queue and wait for every worker to exit. Assignments already
    /// queued are still executed.
    pub async fn shutdown(&mut self) {
        self.assign_tx = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Assignment>>>,
    generator: Arc<dyn Generator>,
    report_tx: mpsc::UnboundedSender<WorkerMessage>,
    timeout: Duration,
) {
    loop {
        // Hold the lock only while waiting for the next assignment.
        let next = { queue.lock().await.recv().await };
        let Some(assignment) = next else {
            debug!(worker, "Worker stopping");
            return;
        };

        let _ = report_tx.send(WorkerMessage::Started {
            worker,
            run_id: assignment.run_id,
            task: assignment.task.clone(),
            attempt: assignment.attempt,
            at: Utc::now(),
        });

        let started = Instant::now();
        let result = execute(generator.as_ref(), &assignment.request, timeout).await;

        let report = WorkerReport {
            worker,
            run_id: assignment.run_id,
            task: assignment.task,
            attempt: assignment.attempt,
            result,
            elapsed: started.elapsed(),
        };
        if report_tx.send(WorkerMessage::Finished(report)).is_err() {
            return;
        }
    }
}

async fn execute(
    generator: &dyn Generator,
    request: &GenerationRequest,
    timeout: Duration,
) -> Result<String, TaskError> {
    let call = AssertUnwindSafe(generator.generate(request)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(TaskError::retryable(format!(
            "generation timed out after {}s",
            timeout.as_secs_f64()
        ))),
        Ok(Err(_)) => Err(TaskError::terminal("generator panicked")),
        Ok(Ok(result)) => result,
    }
}
