//! Merging task queue in front of the dump processor.
//!
//! Pending tasks are keyed by [`TaskKey`]; a task submitted while another one
//! for the same key and channel is still waiting replaces it. Workers never
//! run two tasks for the same [`ConfigKey`] at once, so each key sees its
//! tasks applied one after the other.
use crate::dump::processor::DumpProcessor;
use crate::dump::{DumpError, DumpTask, TaskKey};
use crate::metrics_defs::{DUMP_TASK_FAILED, DUMP_TASK_MERGED, DUMP_TASK_RETRIED, DUMP_TASK_SUBMITTED};
use crate::types::ConfigKey;
use indexmap::IndexMap;
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Called once a task fails in a way the process cannot recover from.
pub type FatalHandler = Arc<dyn Fn(&DumpError) + Send + Sync>;

struct PendingTask {
    task: DumpTask,
    // Set on retried tasks, which must not run before their backoff expires.
    not_before: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    pending: IndexMap<TaskKey, PendingTask>,
    in_flight: HashSet<ConfigKey>,
    shutdown: bool,
}

enum Next {
    Run(DumpTask),
    WaitUntil(Instant),
    Wait,
    Stop,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn next(&mut self, now: Instant) -> Next {
        if self.shutdown {
            return Next::Stop;
        }
        let mut earliest: Option<Instant> = None;
        let mut runnable = None;
        for (index, pending) in self.pending.values().enumerate() {
            if self.in_flight.contains(&pending.task.key) {
                continue;
            }
            match pending.not_before {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => {
                    runnable = Some(index);
                    break;
                }
            }
        }
        match runnable {
            Some(index) => match self.pending.shift_remove_index(index) {
                Some((_, pending)) => {
                    self.in_flight.insert(pending.task.key.clone());
                    Next::Run(pending.task)
                }
                None => Next::Wait,
            },
            None => earliest.map_or(Next::Wait, Next::WaitUntil),
        }
    }
}

struct SchedulerInner {
    state: Mutex<QueueState>,
    // Wakes workers when a task becomes runnable.
    work: Notify,
    // Wakes `wait_idle` callers when the queue drains.
    idle: Notify,
    processor: Arc<DumpProcessor>,
    retry_delay: Duration,
    on_fatal: Option<FatalHandler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DumpScheduler {
    inner: Arc<SchedulerInner>,
}

impl DumpScheduler {
    pub fn new(
        processor: Arc<DumpProcessor>,
        retry_delay: Duration,
        on_fatal: Option<FatalHandler>,
    ) -> Self {
        DumpScheduler {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(QueueState::default()),
                work: Notify::new(),
                idle: Notify::new(),
                processor,
                retry_delay,
                on_fatal,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn processor(&self) -> &Arc<DumpProcessor> {
        &self.inner.processor
    }

    /// Spawns the worker pool. Must be called from within a tokio runtime.
    pub fn start(&self, workers: usize) {
        let mut handles = self.inner.workers.lock();
        for _ in 0..workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move { inner.run_worker().await }));
        }
    }

    pub fn submit(&self, task: DumpTask) {
        counter!(DUMP_TASK_SUBMITTED).increment(1);
        {
            let mut state = self.inner.state.lock();
            let pending = PendingTask {
                task,
                not_before: None,
            };
            if let Some(replaced) = state.pending.insert(pending.task.task_key(), pending) {
                counter!(DUMP_TASK_MERGED).increment(1);
                tracing::debug!(task = %replaced.task.task_key(), "Merged pending dump task");
            }
        }
        self.inner.work.notify_waiters();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Resolves once nothing is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the workers after their current task. Pending tasks are dropped.
    pub async fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.work.notify_waiters();
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dump worker panicked");
            }
        }
    }
}

impl SchedulerInner {
    async fn run_worker(&self) {
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.state.lock().next(Instant::now());
            match next {
                Next::Run(task) => self.run_task(task).await,
                Next::WaitUntil(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait => notified.await,
                Next::Stop => return,
            }
        }
    }

    async fn run_task(&self, task: DumpTask) {
        let result = self.processor.process(&task).await;

        let mut fatal = None;
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&task.key);

            if let Err(e) = result {
                let task_key = task.task_key();
                if e.is_fatal() {
                    counter!(DUMP_TASK_FAILED).increment(1);
                    tracing::error!(task = %task_key, error = %e, "Fatal dump failure");
                    fatal = Some(e);
                } else if e.is_retryable() {
                    counter!(DUMP_TASK_RETRIED).increment(1);
                    tracing::warn!(
                        task = %task_key,
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Dump task failed, retrying"
                    );
                    // A newer task for the same key and channel supersedes the retry.
                    if !state.pending.contains_key(&task_key) {
                        state.pending.insert(
                            task_key,
                            PendingTask {
                                task,
                                not_before: Some(Instant::now() + self.retry_delay),
                            },
                        );
                    }
                } else {
                    counter!(DUMP_TASK_FAILED).increment(1);
                    tracing::error!(task = %task_key, error = %e, "Dropping dump task");
                }
            }

            if state.is_idle() {
                self.idle.notify_waiters();
            }
        }
        self.work.notify_waiters();

        if let (Some(e), Some(on_fatal)) = (fatal, &self.on_fatal) {
            on_fatal(&e);
        }
    }
}
