//! # Otter Test
//!
//! Sequential test execution engine.
//!
//! Test files register tests through a [`Registrar`]; a [`Scheduler`] runs
//! them one at a time, in order, each under a timeout and with its own
//! [`TestContext`] for assertions, timing schedules and nested tests.
//! Failures that escape a test body (background tasks, callback reports) are
//! attributed to the test that was running when they happened.

#![warn(clippy::all)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod loader;
pub mod queue;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod scheduler;

pub use capture::{CaptureGuard, CaptureSink, ErrorCapture};
pub use config::RunnerConfig;
pub use context::{Check, TestContext, Thrown};
pub use discovery::Discovery;
pub use error::{
    AssertionFailure, ConfigError, Failure, Info, LoadError, Origin, RunnerError, TestResult,
    TimingFailure,
};
pub use executor::{ExecutionOutcome, ExecutorSettings, TestExecutor};
pub use loader::{FileLoader, read_source};
pub use queue::{Queue, QueueEntry, Registrar, TestBody};
pub use report::{
    ConsoleReporter, Event, FailureInfo, JsonReporter, PersistedReport, RecordingReporter,
    Reporter, ResultAggregator, RunSummary,
};
pub use runner::Runner;
pub use schedule::{Schedule, ScheduleOptions, Step};
pub use scheduler::{RunCounters, RunState, Scheduler};
