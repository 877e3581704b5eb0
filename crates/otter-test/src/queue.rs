//! Work queue and test registration
//!
//! The queue holds tests and group boundaries in the order they will run.
//! Loaded files append to the tail; a running test inserts its nested tests at
//! the head so they run right after it, before anything queued earlier.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::TestContext;
use crate::error::TestResult;

pub(crate) type SyncBody = Box<dyn FnOnce(&TestContext) -> TestResult + Send>;
pub(crate) type AsyncBody = Box<dyn FnOnce(TestContext) -> BoxFuture<'static, TestResult> + Send>;

/// Code of a registered test
pub enum TestBody {
    /// Runs to completion on the calling task; never raced against a timeout.
    Sync(SyncBody),
    /// Returns a future that is raced against the test's timeout.
    Async(AsyncBody),
}

impl TestBody {
    pub fn sync<F>(body: F) -> Self
    where
        F: FnOnce(&TestContext) -> TestResult + Send + 'static,
    {
        Self::Sync(Box::new(body))
    }

    pub fn from_async<F, Fut>(body: F) -> Self
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self::Async(Box::new(move |ctx| body(ctx).boxed()))
    }
}

impl std::fmt::Debug for TestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestBody::Sync(_) => f.write_str("TestBody::Sync"),
            TestBody::Async(_) => f.write_str("TestBody::Async"),
        }
    }
}

/// One unit of scheduled work
#[derive(Debug)]
pub enum QueueEntry {
    /// A runnable test; `body: None` fails as not implemented.
    Test {
        name: String,
        body: Option<TestBody>,
    },
    /// Opens a group (one per loaded file)
    GroupStart { label: String },
    /// Closes the most recently opened group
    GroupEnd,
}

/// Shared handle to the ordered work list.
///
/// Entries are only ever removed from the head, by the scheduler's drain
/// task. Every insertion wakes that task.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    entries: Arc<Mutex<VecDeque<QueueEntry>>>,
    notify: Arc<Notify>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the tail.
    pub fn append(&self, entry: QueueEntry) {
        self.entries.lock().push_back(entry);
        self.notify.notify_one();
    }

    /// Insert `offset` entries behind the head (0 = new head).
    pub fn insert_front(&self, offset: usize, entry: QueueEntry) {
        {
            let mut entries = self.entries.lock();
            let index = offset.min(entries.len());
            entries.insert(index, entry);
        }
        self.notify.notify_one();
    }

    pub fn pop_front(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wake the drain task without adding anything (e.g. loading finished).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves after the next insertion or wake. A wake that happened while
    /// nobody was waiting is not lost.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Tail,
    Front { next: usize },
}

/// Registration entry point for tests.
///
/// A registrar handed to a file loader appends; the one inside a running
/// test's context inserts at the head, keeping the declaration order of the
/// nested tests it registers.
#[derive(Debug, Clone)]
pub struct Registrar {
    queue: Queue,
    position: Position,
    registered: usize,
}

impl Registrar {
    /// Registrar that appends to the tail of `queue`.
    pub fn appending(queue: Queue) -> Self {
        Self {
            queue,
            position: Position::Tail,
            registered: 0,
        }
    }

    /// Registrar that inserts at the head of `queue`.
    pub fn nested(queue: Queue) -> Self {
        Self {
            queue,
            position: Position::Front { next: 0 },
            registered: 0,
        }
    }

    /// Register an async test.
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.register(name, Some(TestBody::from_async(body)));
    }

    /// Register a synchronous test.
    pub fn test_sync<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&TestContext) -> TestResult + Send + 'static,
    {
        self.register(name, Some(TestBody::sync(body)));
    }

    /// Register a test that has no body yet; it fails as not implemented.
    pub fn todo(&mut self, name: impl Into<String>) {
        self.register(name, None);
    }

    pub fn register(&mut self, name: impl Into<String>, body: Option<TestBody>) {
        let entry = QueueEntry::Test {
            name: name.into(),
            body,
        };
        match &mut self.position {
            Position::Tail => self.queue.append(entry),
            Position::Front { next } => {
                self.queue.insert_front(*next, entry);
                *next += 1;
            }
        }
        self.registered += 1;
    }

    /// Number of tests registered through this registrar.
    pub fn registered(&self) -> usize {
        self.registered
    }
}
