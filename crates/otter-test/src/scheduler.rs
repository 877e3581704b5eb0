//! Queue draining
//!
//! A [`Scheduler`] owns one background task that pops entries from the
//! [`Queue`] head and runs them one at a time. Loading files appends to the
//! queue from the outside while the task drains; the task stops once the
//! queue is empty and loading has been marked complete.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{Failure, RunnerError};
use crate::executor::TestExecutor;
use crate::loader::FileLoader;
use crate::queue::{Queue, QueueEntry, Registrar, TestBody};
use crate::report::{Event, Reporter, ResultAggregator, RunSummary};

/// Counts of one run, shared by the loading side and the drain task.
#[derive(Debug, Default)]
pub struct RunState {
    files_loaded: AtomicUsize,
    tests_run: AtomicUsize,
    tests_failed: AtomicUsize,
    loading_complete: AtomicBool,
}

/// Snapshot of [`RunState`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub files_loaded: usize,
    pub tests_run: usize,
    pub tests_failed: usize,
    pub loading_complete: bool,
}

impl RunState {
    pub fn file_loaded(&self) {
        self.files_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_test(&self, passed: bool) {
        self.tests_run.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.tests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn complete_loading(&self) {
        self.loading_complete.store(true, Ordering::Release);
    }

    pub fn is_loading_complete(&self) -> bool {
        self.loading_complete.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            files_loaded: self.files_loaded.load(Ordering::Relaxed),
            tests_run: self.tests_run.load(Ordering::Relaxed),
            tests_failed: self.tests_failed.load(Ordering::Relaxed),
            loading_complete: self.is_loading_complete(),
        }
    }
}

/// Front end of a run: enqueue files and tests, then wait for the summary.
///
/// Must be created inside a tokio runtime.
pub struct Scheduler {
    queue: Queue,
    state: Arc<RunState>,
    drain: JoinHandle<RunSummary>,
}

impl Scheduler {
    /// Spawn the drain task. It idles until something is enqueued.
    pub fn start(
        executor: TestExecutor,
        reporter: Box<dyn Reporter>,
        aggregator: ResultAggregator,
    ) -> Self {
        let queue = Queue::new();
        let state = Arc::new(RunState::default());
        let drain = tokio::spawn(drain(
            queue.clone(),
            Arc::clone(&state),
            executor,
            reporter,
            aggregator,
        ));
        Self {
            queue,
            state,
            drain,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Registrar that appends top-level tests to the queue.
    pub fn registrar(&self) -> Registrar {
        Registrar::appending(self.queue.clone())
    }

    pub fn enqueue_test(&self, name: impl Into<String>, body: Option<TestBody>) {
        self.registrar().register(name, body);
    }

    /// Load `path` and queue the tests it registers as one group.
    ///
    /// A load error does not stop the run: the group gets a single failing
    /// test named after the file instead.
    pub fn enqueue_file(&self, path: &Path, loader: &dyn FileLoader) {
        let label = path.display().to_string();
        self.queue.append(QueueEntry::GroupStart {
            label: label.clone(),
        });

        let mut registrar = self.registrar();
        match loader.load(path, &mut registrar) {
            Ok(()) => {
                tracing::debug!(file = %label, tests = registrar.registered(), "file loaded");
            }
            Err(e) => {
                tracing::warn!(file = %label, error = %e, "failed to load test file");
                let message = e.to_string();
                registrar.register(
                    label,
                    Some(TestBody::sync(move |_| Err(Failure::thrown(message)))),
                );
            }
        }

        self.queue.append(QueueEntry::GroupEnd);
        self.state.file_loaded();
    }

    /// No more files or top-level tests will be enqueued.
    pub fn finish_loading(&self) {
        self.state.complete_loading();
        self.queue.wake();
    }

    /// Mark loading complete and wait for the drain task to run everything.
    pub async fn wait(self) -> Result<RunSummary, RunnerError> {
        self.finish_loading();
        self.drain
            .await
            .map_err(|e| RunnerError::Scheduler(e.to_string()))
    }
}

async fn drain(
    queue: Queue,
    state: Arc<RunState>,
    executor: TestExecutor,
    mut reporter: Box<dyn Reporter>,
    mut aggregator: ResultAggregator,
) -> RunSummary {
    let mut groups: Vec<String> = Vec::new();

    loop {
        let Some(entry) = queue.pop_front() else {
            if state.is_loading_complete() && queue.is_empty() {
                break;
            }
            tracing::trace!("queue empty, waiting for more work");
            queue.changed().await;
            continue;
        };

        match entry {
            QueueEntry::GroupStart { label } => {
                tracing::debug!(group = %label, "group start");
                reporter.report(&Event::GroupStart {
                    label: label.clone(),
                });
                groups.push(label);
            }
            QueueEntry::GroupEnd => {
                groups.pop();
                reporter.report(&Event::GroupEnd);
            }
            QueueEntry::Test { name, body } => {
                let outcome = executor.run(&name, body, &queue).await;
                aggregator.record(
                    &state,
                    groups.last().map(String::as_str),
                    &name,
                    &outcome,
                );
                reporter.report(&Event::TestResult { name, outcome });
            }
        }
    }

    let summary = aggregator.finish(&state);
    tracing::info!(
        files = summary.files_loaded,
        tests = summary.tests_run,
        failed = summary.tests_failed,
        "run finished"
    );
    reporter.report(&Event::Summary(summary.clone()));
    summary
}
