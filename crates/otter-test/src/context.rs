//! The capability object handed to a test body
//!
//! A [`TestContext`] is created fresh for every test execution. It counts
//! assertions, carries the test's timeout, owns the schedules the test
//! declares and registers nested tests.
//!
//! Assertions return [`TestResult`]; bodies propagate them with `?`, so the
//! first failing assertion ends the body. Every assertion except
//! [`TestContext::fail`] counts toward the number checked by `expect(n)`.
//!
//! Extra `info` fields and the sorted-keys display hint are set through a
//! [`Check`]:
//!
//! ```ignore
//! t.with_info(info).sorted().equal(&actual, &expected)?;
//! ```

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::capture::{CaptureSink, QuietPanics, payload_message, quiet_poll};
use crate::error::{AssertionFailure, Failure, Info, Origin, TestResult};
use crate::executor::ExecutorSettings;
use crate::queue::{Queue, Registrar, TestBody};
use crate::schedule::{Schedule, ScheduleOptions, Step};

/// What a `throws*` callback raised
#[derive(Debug)]
pub enum Thrown<E> {
    /// The callback returned `Err`
    Error(E),
    /// The callback panicked
    Panic(String),
}

impl<E: Debug> Thrown<E> {
    fn describe(&self) -> String {
        match self {
            Thrown::Error(error) => format!("{error:?}"),
            Thrown::Panic(message) => format!("panicked: {message}"),
        }
    }
}

#[derive(Debug)]
struct ExecutionState {
    expected: Option<usize>,
    actual: usize,
    sort_keys: bool,
    schedules: Vec<Schedule>,
    registrar: Registrar,
    tasks: Vec<AbortHandle>,
    concluded: bool,
}

#[derive(Debug)]
struct ContextInner {
    name: String,
    state: Mutex<ExecutionState>,
    timeout: watch::Sender<Duration>,
    schedule_options: ScheduleOptions,
    sink: CaptureSink,
}

/// Per-test assertion and registration surface.
#[derive(Debug, Clone)]
pub struct TestContext {
    inner: Arc<ContextInner>,
}

/// State collected from a context once its body has settled.
#[derive(Debug)]
pub(crate) struct Conclusion {
    pub expected: Option<usize>,
    pub actual: usize,
    pub sort_keys: bool,
    pub schedules: Vec<Schedule>,
}

impl TestContext {
    pub(crate) fn new(
        name: impl Into<String>,
        queue: Queue,
        sink: CaptureSink,
        settings: &ExecutorSettings,
    ) -> Self {
        let (timeout, _) = watch::channel(settings.timeout);
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                state: Mutex::new(ExecutionState {
                    expected: None,
                    actual: 0,
                    sort_keys: false,
                    schedules: Vec::new(),
                    registrar: Registrar::nested(queue),
                    tasks: Vec::new(),
                    concluded: false,
                }),
                timeout,
                schedule_options: ScheduleOptions::default().with_tolerance(settings.tolerance),
                sink,
            }),
        }
    }

    /// Name the test was registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Require exactly `n` assertions in this test. Resets the count.
    pub fn expect(&self, n: usize) {
        let mut state = self.inner.state.lock();
        state.expected = Some(n);
        state.actual = 0;
    }

    /// Override the timeout of this test. Takes effect immediately, also
    /// while the body is already being raced.
    pub fn timeout(&self, duration: Duration) {
        self.inner.timeout.send_replace(duration);
    }

    pub(crate) fn timeout_watch(&self) -> watch::Receiver<Duration> {
        self.inner.timeout.subscribe()
    }

    /// Assertions carrying extra `info` fields.
    pub fn with_info(&self, info: Info) -> Check<'_> {
        Check {
            ctx: self,
            info,
            sort_keys: false,
        }
    }

    /// Assertions whose failures render with sorted keys.
    pub fn sorted(&self) -> Check<'_> {
        self.check().sorted()
    }

    fn check(&self) -> Check<'_> {
        self.with_info(Info::new())
    }

    /// Fails with `not ok` unless `value` is true.
    pub fn ok(&self, value: bool) -> TestResult {
        self.check().ok(value)
    }

    /// Fails with `not equal` unless both sides serialize to equal values.
    pub fn equal<A, E>(&self, actual: A, expected: E) -> TestResult
    where
        A: Serialize,
        E: Serialize,
    {
        self.check().equal(actual, expected)
    }

    /// Fails with `didn't throw` if `callback` returns `Ok` without panicking.
    pub fn throws<F, T, E>(&self, callback: F) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.check().throws(callback)
    }

    pub async fn throws_async<F, Fut, T, E>(&self, callback: F) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check().throws_async(callback).await
    }

    /// Fails with `did throw` if `callback` returns `Err` or panics.
    pub fn throws_not<F, T, E>(&self, callback: F) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
        E: Debug,
    {
        self.check().throws_not(callback)
    }

    pub async fn throws_not_async<F, Fut, T, E>(&self, callback: F) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        self.check().throws_not_async(callback).await
    }

    /// Like [`throws`](Self::throws), then validates the raised value.
    pub fn throws_with<F, T, E, A>(&self, callback: F, assertion: A) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
        A: FnOnce(Thrown<E>) -> TestResult,
    {
        self.check().throws_with(callback, assertion)
    }

    pub async fn throws_with_async<F, Fut, T, E, A>(&self, callback: F, assertion: A) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: FnOnce(Thrown<E>) -> TestResult,
    {
        self.check().throws_with_async(callback, assertion).await
    }

    /// Abort the test with `failed`. Not counted as an assertion.
    pub fn fail<T>(&self) -> TestResult<T> {
        self.check().fail()
    }

    /// Declare a schedule with the default options.
    pub fn schedule(&self, steps: impl IntoIterator<Item = Step>) -> Schedule {
        self.schedule_with(steps, self.inner.schedule_options)
    }

    pub fn schedule_with(
        &self,
        steps: impl IntoIterator<Item = Step>,
        options: ScheduleOptions,
    ) -> Schedule {
        let schedule = Schedule::new(steps, options);
        self.inner.state.lock().schedules.push(schedule.clone());
        schedule
    }

    /// Register a nested async test. It runs right after this test, before
    /// any test that was already queued.
    pub fn test<F, Fut>(&self, name: impl Into<String>, body: F)
    where
        F: FnOnce(TestContext) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.register(name, Some(TestBody::from_async(body)));
    }

    /// Register a nested synchronous test.
    pub fn test_sync<F>(&self, name: impl Into<String>, body: F)
    where
        F: FnOnce(&TestContext) -> TestResult + Send + 'static,
    {
        self.register(name, Some(TestBody::sync(body)));
    }

    /// Register a nested test without a body.
    pub fn todo(&self, name: impl Into<String>) {
        self.register(name, None);
    }

    /// Register a nested test with an optional body.
    pub fn register(&self, name: impl Into<String>, body: Option<TestBody>) {
        let name = name.into();
        let mut state = self.inner.state.lock();
        if state.concluded {
            tracing::warn!(
                parent = %self.inner.name,
                test = %name,
                "ignoring nested test registered after its parent finished"
            );
            return;
        }
        state.registrar.register(name, body);
    }

    /// Run `task` in the background. If it fails or panics while this test is
    /// still running, the test fails with that error unless it already failed
    /// on its own. Tasks still running when the test concludes are aborted.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = TestResult> + Send + 'static,
    {
        let sink = self.inner.sink.clone();
        let handle = tokio::spawn(async move {
            let (origin, message) = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(failure)) => (Origin::Task, format!("background task failed: {failure}")),
                Err(panic) => (
                    Origin::Panic,
                    format!("background task panicked: {}", payload_message(&*panic)),
                ),
            };
            sink.report(Failure::Unexpected { origin, message });
        });

        let mut state = self.inner.state.lock();
        if state.concluded {
            handle.abort();
        } else {
            state.tasks.push(handle.abort_handle());
        }
    }

    /// Sink for callbacks that want to fail this test from outside the body.
    pub fn capture_sink(&self) -> CaptureSink {
        self.inner.sink.clone()
    }

    fn count(&self, sort_keys: bool) {
        let mut state = self.inner.state.lock();
        state.actual += 1;
        state.sort_keys = sort_keys;
    }

    pub(crate) fn conclude(&self) -> Conclusion {
        let mut state = self.inner.state.lock();
        state.concluded = true;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        Conclusion {
            expected: state.expected,
            actual: state.actual,
            sort_keys: state.sort_keys,
            schedules: std::mem::take(&mut state.schedules),
        }
    }
}

/// An assertion about to be made, with its info fields and display hint.
#[derive(Debug)]
pub struct Check<'a> {
    ctx: &'a TestContext,
    info: Info,
    sort_keys: bool,
}

impl Check<'_> {
    /// Merge more info fields.
    pub fn info(mut self, info: Info) -> Self {
        self.info.extend(info);
        self
    }

    /// Render a failure of this assertion with sorted keys.
    pub fn sorted(mut self) -> Self {
        self.sort_keys = true;
        self
    }

    pub fn ok(self, value: bool) -> TestResult {
        self.ctx.count(self.sort_keys);
        if value {
            Ok(())
        } else {
            Err(AssertionFailure::NotOk { info: self.info }.into())
        }
    }

    pub fn equal<A, E>(self, actual: A, expected: E) -> TestResult
    where
        A: Serialize,
        E: Serialize,
    {
        self.ctx.count(self.sort_keys);
        let actual = to_value(actual, "actual")?;
        let expected = to_value(expected, "expected")?;
        if actual == expected {
            Ok(())
        } else {
            Err(AssertionFailure::NotEqual {
                expected,
                actual,
                info: self.info,
            }
            .into())
        }
    }

    pub fn throws<F, T, E>(self, callback: F) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.ctx.count(self.sort_keys);
        match catch(callback) {
            Ok(_) => Err(self.did_not_throw::<F>()),
            Err(_) => Ok(()),
        }
    }

    pub async fn throws_async<F, Fut, T, E>(self, callback: F) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.ctx.count(self.sort_keys);
        match catch_async(callback).await {
            Ok(_) => Err(self.did_not_throw::<F>()),
            Err(_) => Ok(()),
        }
    }

    pub fn throws_not<F, T, E>(self, callback: F) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
        E: Debug,
    {
        self.ctx.count(self.sort_keys);
        match catch(callback) {
            Ok(_) => Ok(()),
            Err(thrown) => Err(self.did_throw::<F, E>(&thrown)),
        }
    }

    pub async fn throws_not_async<F, Fut, T, E>(self, callback: F) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        self.ctx.count(self.sort_keys);
        match catch_async(callback).await {
            Ok(_) => Ok(()),
            Err(thrown) => Err(self.did_throw::<F, E>(&thrown)),
        }
    }

    pub fn throws_with<F, T, E, A>(self, callback: F, assertion: A) -> TestResult
    where
        F: FnOnce() -> Result<T, E>,
        A: FnOnce(Thrown<E>) -> TestResult,
    {
        self.ctx.count(self.sort_keys);
        match catch(callback) {
            Ok(_) => Err(self.did_not_throw::<F>()),
            Err(thrown) => assertion(thrown),
        }
    }

    pub async fn throws_with_async<F, Fut, T, E, A>(self, callback: F, assertion: A) -> TestResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: FnOnce(Thrown<E>) -> TestResult,
    {
        self.ctx.count(self.sort_keys);
        match catch_async(callback).await {
            Ok(_) => Err(self.did_not_throw::<F>()),
            Err(thrown) => assertion(thrown),
        }
    }

    pub fn fail<T>(self) -> TestResult<T> {
        self.ctx.inner.state.lock().sort_keys = self.sort_keys;
        Err(AssertionFailure::Failed { info: self.info }.into())
    }

    fn did_not_throw<F>(self) -> Failure {
        AssertionFailure::DidNotThrow {
            callback: type_name::<F>().to_string(),
            info: self.info,
        }
        .into()
    }

    fn did_throw<F, E: Debug>(self, thrown: &Thrown<E>) -> Failure {
        AssertionFailure::DidThrow {
            error: thrown.describe(),
            callback: type_name::<F>().to_string(),
            info: self.info,
        }
        .into()
    }
}

fn to_value<T: Serialize>(value: T, side: &str) -> TestResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| Failure::thrown(format!("cannot compare {side} value: {e}")))
}

fn catch<F, T, E>(callback: F) -> Result<T, Thrown<E>>
where
    F: FnOnce() -> Result<T, E>,
{
    let _quiet = QuietPanics::enter();
    match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Thrown::Error(error)),
        Err(panic) => Err(Thrown::Panic(payload_message(&*panic))),
    }
}

async fn catch_async<F, Fut, T, E>(callback: F) -> Result<T, Thrown<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let caught = AssertUnwindSafe(async move { callback().await }).catch_unwind();
    match quiet_poll(caught).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Thrown::Error(error)),
        Err(panic) => Err(Thrown::Panic(payload_message(&*panic))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ErrorCapture;
    use crate::error::TimingFailure;
    use crate::queue::QueueEntry;
    use serde_json::json;

    fn context(queue: &Queue, capture: &ErrorCapture) -> (TestContext, crate::capture::CaptureGuard) {
        let guard = capture.install();
        let ctx = TestContext::new(
            "ctx",
            queue.clone(),
            guard.sink(),
            &ExecutorSettings::default(),
        );
        (ctx, guard)
    }

    fn info(value: Value) -> Info {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_equal_is_structural() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, _guard) = context(&queue, &capture);

        t.equal(json!({"a": 1, "b": [1, 2]}), json!({"b": [1, 2], "a": 1}))
            .unwrap();
        t.equal(vec![1, 2, 3], [1, 2, 3]).unwrap();

        let err = t.equal([1, 2], [2, 1]).unwrap_err();
        assert_eq!(
            err,
            Failure::Assertion(AssertionFailure::NotEqual {
                expected: json!([2, 1]),
                actual: json!([1, 2]),
                info: Info::new(),
            })
        );
        assert_eq!(t.conclude().actual, 3);
    }

    #[test]
    fn test_ok_with_info_and_sort_hint() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, _guard) = context(&queue, &capture);

        let err = t
            .with_info(info(json!({"input": 3})))
            .sorted()
            .ok(false)
            .unwrap_err();
        assert_eq!(
            err,
            Failure::Assertion(AssertionFailure::NotOk {
                info: info(json!({"input": 3})),
            })
        );
        assert!(t.conclude().sort_keys);
    }

    #[test]
    fn test_expect_resets_count() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, _guard) = context(&queue, &capture);

        t.ok(true).unwrap();
        t.expect(2);
        t.ok(true).unwrap();
        let _ = t.fail::<()>();
        let conclusion = t.conclude();
        assert_eq!(conclusion.expected, Some(2));
        assert_eq!(conclusion.actual, 1);
    }

    #[test]
    fn test_throws_family() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, guard) = context(&queue, &capture);

        t.throws(|| Err::<(), _>("bad")).unwrap();
        t.throws(|| -> Result<(), ()> { panic!("bad") }).unwrap();
        assert!(matches!(
            t.throws(|| Ok::<_, ()>(1)),
            Err(Failure::Assertion(AssertionFailure::DidNotThrow { .. }))
        ));

        t.throws_not(|| Ok::<_, String>(())).unwrap();
        match t.throws_not(|| Err::<(), _>("nope")) {
            Err(Failure::Assertion(AssertionFailure::DidThrow { error, .. })) => {
                assert_eq!(error, "\"nope\"")
            }
            other => panic!("unexpected result: {other:?}"),
        }

        t.throws_with(
            || "x".parse::<u32>(),
            |thrown| match thrown {
                Thrown::Error(e) => t.equal(e.to_string(), "invalid digit found in string"),
                Thrown::Panic(_) => t.fail(),
            },
        )
        .unwrap();
        assert!(matches!(
            t.throws_with(|| Ok::<_, ()>(1), |_| Ok(())),
            Err(Failure::Assertion(AssertionFailure::DidNotThrow { .. }))
        ));

        // Deliberately caught panics must not leak into the capture slot.
        assert_eq!(guard.take(), None);
    }

    #[test]
    fn test_throws_with_propagates_assertion_failure() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, _guard) = context(&queue, &capture);

        let err = t
            .throws_with(|| Err::<(), _>(1), |_| t.equal(1, 2))
            .unwrap_err();
        assert!(matches!(
            err,
            Failure::Assertion(AssertionFailure::NotEqual { .. })
        ));
    }

    #[tokio::test]
    async fn test_throws_async() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, guard) = context(&queue, &capture);

        t.throws_async(|| async { Err::<(), _>("rejected") })
            .await
            .unwrap();
        t.throws_not_async(|| async { Ok::<_, ()>(()) }).await.unwrap();
        match t.throws_not_async(|| async { Err::<(), _>("x") }).await {
            Err(Failure::Assertion(AssertionFailure::DidThrow { error, .. })) => {
                assert_eq!(error, "\"x\"")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            t.throws_with_async(|| async { Ok::<_, ()>(1) }, |_| Ok(())).await,
            Err(Failure::Assertion(AssertionFailure::DidNotThrow { .. }))
        ));
        assert!(
            t.throws_async(|| async { Ok::<_, ()>(()) })
                .await
                .is_err()
        );
        t.throws_with_async(
            || async { Err::<(), _>(7) },
            |thrown| match thrown {
                Thrown::Error(code) => t.equal(code, 7),
                Thrown::Panic(_) => t.fail(),
            },
        )
        .await
        .unwrap();
        assert_eq!(guard.take(), None);
    }

    #[test]
    fn test_nested_registration_goes_to_front() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        queue.append(QueueEntry::Test {
            name: "sibling".into(),
            body: None,
        });
        let (t, _guard) = context(&queue, &capture);

        t.todo("nested a");
        t.todo("nested b");
        t.conclude();
        t.todo("too late");

        let names: Vec<String> = std::iter::from_fn(|| queue.pop_front())
            .map(|entry| match entry {
                QueueEntry::Test { name, .. } => name,
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        assert_eq!(names, ["nested a", "nested b", "sibling"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_tracked() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, _guard) = context(&queue, &capture);

        let schedule = t.schedule([Step::at(0, ["a"]), Step::at(10, ["b"])]);
        schedule.start();
        schedule.step(["a"]).unwrap();

        let conclusion = t.conclude();
        assert_eq!(conclusion.schedules.len(), 1);
        assert_eq!(
            conclusion.schedules[0].finish(),
            Err(Failure::Timing(TimingFailure::MissedSteps {
                remaining: vec![Step::at(10, ["b"])],
            }))
        );
    }

    #[tokio::test]
    async fn test_spawned_failure_reaches_capture() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, guard) = context(&queue, &capture);

        let inner = t.clone();
        t.spawn(async move { inner.equal(1, 2) });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let failure = guard.take().expect("background failure captured");
        assert!(matches!(
            failure,
            Failure::Unexpected {
                origin: Origin::Task,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_panic_during_throws_async_is_captured() {
        let (queue, capture) = (Queue::new(), ErrorCapture::new());
        let (t, guard) = context(&queue, &capture);

        let boom = true;
        t.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if boom {
                panic!("background boom");
            }
            Ok(())
        });
        t.throws_async(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<(), _>("rejected")
        })
        .await
        .unwrap();

        match guard.take() {
            Some(Failure::Unexpected {
                origin: Origin::Panic,
                message,
            }) => assert_eq!(message, "background task panicked: background boom"),
            other => panic!("unexpected capture: {other:?}"),
        }
    }
}
