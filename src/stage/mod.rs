//! Named bounded worker stages. Each stage owns a FIFO queue and a fixed
//! worker count; tasks that sit queued past their verb's RPC timeout are
//! dropped instead of executed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::messaging::Verb;
use crate::utils::CoordError;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// A queued unit of work with droppable semantics.
pub struct StageTask {
    /// Verb whose timeout bounds this task's queue age.
    pub verb: Verb,

    /// When the task was enqueued.
    pub enqueued: Instant,

    /// Maximum queue age before the task is dropped unexecuted.
    pub max_queue_age: Duration,

    /// The work itself.
    pub job: Pin<Box<dyn Future<Output = ()> + Send>>,

    /// Invoked instead of the job when the task is dropped for age.
    pub on_drop: Option<Box<dyn FnOnce(Verb) + Send>>,
}

impl StageTask {
    pub fn new(
        verb: Verb,
        max_queue_age: Duration,
        job: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        StageTask {
            verb,
            enqueued: Instant::now(),
            max_queue_age,
            job: Box::pin(job),
            on_drop: None,
        }
    }

    /// Replaces the default drop handling.
    pub fn with_on_drop(
        mut self,
        on_drop: impl FnOnce(Verb) + Send + 'static,
    ) -> Self {
        self.on_drop = Some(Box::new(on_drop));
        self
    }
}

/// One named worker pool.
pub struct Stage {
    name: &'static str,
    tx: mpsc::Sender<StageTask>,
    _workers: Vec<JoinHandle<()>>,
}

impl Stage {
    /// Creates the stage and spawns its workers.
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        debug_assert!(workers > 0 && capacity > 0);
        let (tx, rx) = mpsc::channel::<StageTask>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let task = { rx.lock().await.recv().await };
                        match task {
                            Some(task) => Self::run_task(task).await,
                            None => break, // stage dropped
                        }
                    }
                })
            })
            .collect();

        Stage {
            name,
            tx,
            _workers: handles,
        }
    }

    async fn run_task(task: StageTask) {
        if task.enqueued.elapsed() > task.max_queue_age {
            pf_trace!("stage"; "dropping aged {:?} task", task.verb);
            if let Some(on_drop) = task.on_drop {
                on_drop(task.verb);
            }
            return;
        }
        task.job.await;
    }

    /// Enqueues a task, waiting for queue room if the stage is full.
    pub async fn submit(&self, task: StageTask) -> Result<(), CoordError> {
        self.tx
            .send(task)
            .await
            .map_err(|_| CoordError::msg(format!("stage {} shut down", self.name)))
    }
}

/// The coordinator's named stages.
pub struct Stages {
    pub mutation: Stage,
    pub counter_mutation: Stage,
    pub read: Stage,
    pub request_response: Stage,
}

impl Stages {
    pub fn new(workers: usize, capacity: usize) -> Self {
        Stages {
            mutation: Stage::new("mutation", workers, capacity),
            counter_mutation: Stage::new("counter-mutation", workers, capacity),
            read: Stage::new("read", workers, capacity),
            request_response: Stage::new("request-response", workers, capacity),
        }
    }
}
