//! Execution of a single test
//!
//! [`TestExecutor::run`] installs the error capture, builds a fresh
//! [`TestContext`], runs the body (racing async bodies against the test's
//! timeout), applies the post-checks and folds everything into one
//! [`ExecutionOutcome`].
//!
//! Error precedence, first non-empty wins:
//! 1. the body's own error (returned `Err`, panic, or timeout)
//! 2. a failure delivered to the capture while the test ran
//! 3. post-checks: assertion count, then unconsumed schedule steps

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::capture::{ErrorCapture, payload_message};
use crate::context::{Conclusion, TestContext};
use crate::error::{Failure, TestResult};
use crate::queue::{AsyncBody, Queue, TestBody};
use crate::schedule::DEFAULT_TOLERANCE;

/// Timeout applied when a test does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Defaults every test context starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Per-test timeout until the body calls `timeout`
    pub timeout: Duration,
    /// Tolerance of schedules declared without explicit options
    pub tolerance: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Result of running one test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    /// `None` when the test passed
    #[serde(serialize_with = "serialize_failure")]
    pub error: Option<Failure>,
    /// Render the error with sorted keys
    pub sort_keys: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    fn not_implemented() -> Self {
        Self {
            error: Some(Failure::NotImplemented),
            sort_keys: false,
            duration: Duration::ZERO,
        }
    }
}

fn serialize_failure<S: Serializer>(
    failure: &Option<Failure>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    failure.as_ref().map(Failure::to_value).serialize(serializer)
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Runs test bodies one at a time.
#[derive(Debug, Default)]
pub struct TestExecutor {
    capture: ErrorCapture,
    settings: ExecutorSettings,
}

impl TestExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            capture: ErrorCapture::new(),
            settings,
        }
    }

    /// Run one test. Nested tests the body registers are inserted at the head
    /// of `queue`.
    pub async fn run(&self, name: &str, body: Option<TestBody>, queue: &Queue) -> ExecutionOutcome {
        let Some(body) = body else {
            tracing::debug!(test = name, "test has no body");
            return ExecutionOutcome::not_implemented();
        };

        let started = Instant::now();
        let guard = self.capture.install();
        let ctx = TestContext::new(name, queue.clone(), guard.sink(), &self.settings);

        let own = match body {
            TestBody::Sync(body) => {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));
                settle(result)
            }
            TestBody::Async(body) => self.race(&ctx, body).await,
        };

        // Background work that is already runnable gets one turn to report
        // before the capture window closes.
        tokio::task::yield_now().await;

        let conclusion = ctx.conclude();
        let captured = guard.take();
        drop(guard);

        let error = own.or(captured).or_else(|| post_checks(&conclusion));
        match &error {
            Some(failure) => tracing::debug!(test = name, %failure, "test failed"),
            None => tracing::debug!(test = name, "test passed"),
        }

        ExecutionOutcome {
            error,
            sort_keys: conclusion.sort_keys,
            duration: started.elapsed(),
        }
    }

    /// Race the body against the test's timeout. The deadline is re-armed
    /// whenever the body changes its timeout.
    async fn race(&self, ctx: &TestContext, body: AsyncBody) -> Option<Failure> {
        let mut timeout = ctx.timeout_watch();
        let started = Instant::now();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| body(ctx.clone()))) {
            Ok(future) => future,
            Err(panic) => {
                return Some(Failure::Panicked {
                    message: payload_message(&*panic),
                });
            }
        };
        let mut future = std::pin::pin!(AssertUnwindSafe(future).catch_unwind());

        loop {
            let limit = *timeout.borrow_and_update();
            tokio::select! {
                biased;
                result = &mut future => return settle(result),
                _ = tokio::time::sleep_until(started + limit) => {
                    tracing::debug!(test = ctx.name(), ?limit, "test timed out");
                    // Dropping the body future cancels it.
                    return Some(Failure::Timeout {
                        after_ms: limit.as_millis() as u64,
                    });
                }
                Ok(()) = timeout.changed() => continue,
            }
        }
    }
}

fn settle(result: std::thread::Result<TestResult>) -> Option<Failure> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(failure)) => Some(failure),
        Err(panic) => Some(Failure::Panicked {
            message: payload_message(&*panic),
        }),
    }
}

fn post_checks(conclusion: &Conclusion) -> Option<Failure> {
    if let Some(expected) = conclusion.expected {
        if expected != conclusion.actual {
            return Some(Failure::CountMismatch {
                expected,
                actual: conclusion.actual,
            });
        }
    }
    conclusion
        .schedules
        .iter()
        .find_map(|schedule| schedule.finish().err())
}
