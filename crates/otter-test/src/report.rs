//! Test result reporting
//!
//! The scheduler emits one [`Event`] per queue entry plus a final summary.
//! Reporters turn those events into output; [`ResultAggregator`] turns test
//! outcomes into the counts and failure details of the [`RunSummary`].

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use colored::Colorize;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::executor::ExecutionOutcome;
use crate::scheduler::RunState;

/// Something the scheduler tells a reporter
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    GroupStart {
        label: String,
    },
    GroupEnd,
    TestResult {
        name: String,
        outcome: ExecutionOutcome,
    },
    Summary(RunSummary),
}

/// Receives scheduler events in queue order
pub trait Reporter: Send {
    fn report(&mut self, event: &Event);
}

/// Details of one failed test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureInfo {
    /// Group (file) the test belongs to
    pub group: Option<String>,
    /// Test name
    pub name: String,
    /// Structured failure
    pub error: Value,
}

/// One row of a saved report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRecord {
    pub group: Option<String>,
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Final counts of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub files_loaded: usize,
    pub tests_run: usize,
    pub tests_failed: usize,
    /// First failures, up to the configured maximum
    pub failures: Vec<FailureInfo>,
    /// Every result, only collected when requested
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TestRecord>,
}

impl RunSummary {
    pub fn tests_passed(&self) -> usize {
        self.tests_run - self.tests_failed
    }

    pub fn success(&self) -> bool {
        self.tests_failed == 0
    }

    /// 0 when every test passed, 1 otherwise.
    pub fn exit_status(&self) -> u8 {
        if self.success() { 0 } else { 1 }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}

/// Folds test outcomes into the run counters and keeps failure details.
#[derive(Debug)]
pub struct ResultAggregator {
    started_at: DateTime<Utc>,
    started: Instant,
    max_failures: usize,
    keep_results: bool,
    failures: Vec<FailureInfo>,
    results: Vec<TestRecord>,
}

impl ResultAggregator {
    pub fn new(max_failures: usize) -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            max_failures,
            keep_results: false,
            failures: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Also keep a record of every test, for saved reports.
    pub fn keep_results(mut self, keep: bool) -> Self {
        self.keep_results = keep;
        self
    }

    pub fn record(
        &mut self,
        state: &RunState,
        group: Option<&str>,
        name: &str,
        outcome: &ExecutionOutcome,
    ) {
        state.record_test(outcome.passed());

        let error = outcome.error.as_ref().map(|failure| failure.to_value());
        if let Some(error) = &error {
            if self.failures.len() < self.max_failures {
                self.failures.push(FailureInfo {
                    group: group.map(str::to_string),
                    name: name.to_string(),
                    error: error.clone(),
                });
            }
        }
        if self.keep_results {
            self.results.push(TestRecord {
                group: group.map(str::to_string),
                name: name.to_string(),
                passed: outcome.passed(),
                duration_ms: outcome.duration.as_millis() as u64,
                error,
            });
        }
    }

    pub fn finish(self, state: &RunState) -> RunSummary {
        let counters = state.counters();
        RunSummary {
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            files_loaded: counters.files_loaded,
            tests_run: counters.tests_run,
            tests_failed: counters.tests_failed,
            failures: self.failures,
            results: self.results,
        }
    }
}

/// Report written by `--save`
#[derive(Debug, Serialize)]
pub struct PersistedReport {
    pub version: String,
    pub summary: RunSummary,
}

impl PersistedReport {
    pub fn new(summary: RunSummary) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            summary,
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Render a failure as indented JSON, recursively sorting object keys when
/// asked to.
pub fn render_error(error: &Value, sort_keys: bool) -> String {
    let value = if sort_keys {
        sorted(error.clone())
    } else {
        error.clone()
    };
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sorted(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Human-readable, colored output: one line per test, failures indented below.
pub struct ConsoleReporter<W: Write + Send = io::Stdout> {
    out: W,
    depth: usize,
    verbose: bool,
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout(verbose: bool) -> Self {
        Self::new(io::stdout(), verbose)
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self {
            out,
            depth: 0,
            verbose,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn indent(&self) -> String {
        "  ".repeat(self.depth)
    }

    fn write_summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "{}", "=== Results ===".bold())?;
        writeln!(self.out, "Files:   {}", summary.files_loaded)?;
        writeln!(self.out, "Tests:   {}", summary.tests_run)?;
        writeln!(
            self.out,
            "Passed:  {}",
            summary.tests_passed().to_string().green()
        )?;
        let failed = summary.tests_failed.to_string();
        if summary.success() {
            writeln!(self.out, "Failed:  {failed}")?;
        } else {
            writeln!(self.out, "Failed:  {}", failed.red().bold())?;
        }
        writeln!(self.out, "Time:    {}ms", summary.duration_ms)?;

        if !summary.failures.is_empty() {
            writeln!(self.out)?;
            writeln!(self.out, "{}", "=== Failures ===".bold().red())?;
            for failure in &summary.failures {
                let message = failure.error["message"].as_str().unwrap_or("failed");
                match &failure.group {
                    Some(group) => {
                        writeln!(self.out, "  {} > {} - {}", group.yellow(), failure.name, message)?
                    }
                    None => writeln!(self.out, "  {} - {}", failure.name, message)?,
                }
            }
            if summary.tests_failed > summary.failures.len() {
                writeln!(
                    self.out,
                    "  ... and {} more",
                    summary.tests_failed - summary.failures.len()
                )?;
            }
        }
        Ok(())
    }

    fn write_event(&mut self, event: &Event) -> io::Result<()> {
        match event {
            Event::GroupStart { label } => {
                writeln!(self.out, "{}{}", self.indent(), label.bold())?;
                self.depth += 1;
            }
            Event::GroupEnd => {
                self.depth = self.depth.saturating_sub(1);
            }
            Event::TestResult { name, outcome } => {
                let indent = self.indent();
                let timing = if self.verbose {
                    format!(" ({}ms)", outcome.duration.as_millis())
                } else {
                    String::new()
                };
                match &outcome.error {
                    None => writeln!(self.out, "{indent}{} {name}{timing}", "ok".green())?,
                    Some(failure) => {
                        writeln!(self.out, "{indent}{} {name}{timing}", "FAIL".red().bold())?;
                        let rendered = render_error(&failure.to_value(), outcome.sort_keys);
                        for line in rendered.lines() {
                            writeln!(self.out, "{indent}    {line}")?;
                        }
                    }
                }
            }
            Event::Summary(summary) => self.write_summary(summary)?,
        }
        self.out.flush()
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn report(&mut self, event: &Event) {
        if let Err(e) = self.write_event(event) {
            tracing::warn!(error = %e, "failed to write report");
        }
    }
}

/// One JSON object per event, one event per line.
pub struct JsonReporter<W: Write + Send = io::Stdout> {
    out: W,
}

impl JsonReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Reporter for JsonReporter<W> {
    fn report(&mut self, event: &Event) {
        let written = serde_json::to_string(event)
            .map_err(io::Error::other)
            .and_then(|line| writeln!(self.out, "{line}"));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write report");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Names of the reported tests, in report order.
    pub fn test_names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::TestResult { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn report(&mut self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AssertionFailure, Failure, Info};
    use serde_json::json;
    use std::time::Duration;

    fn failed(failure: Failure) -> ExecutionOutcome {
        ExecutionOutcome {
            error: Some(failure),
            sort_keys: false,
            duration: Duration::from_millis(3),
        }
    }

    fn passed() -> ExecutionOutcome {
        ExecutionOutcome {
            error: None,
            sort_keys: false,
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_aggregator_counts() {
        let state = RunState::default();
        state.file_loaded();
        let mut aggregator = ResultAggregator::new(1).keep_results(true);

        aggregator.record(&state, Some("a.test"), "one", &passed());
        aggregator.record(&state, Some("a.test"), "two", &failed(Failure::NotImplemented));
        aggregator.record(&state, Some("a.test"), "three", &failed(Failure::NotImplemented));

        let summary = aggregator.finish(&state);
        assert_eq!(summary.files_loaded, 1);
        assert_eq!(summary.tests_run, 3);
        assert_eq!(summary.tests_failed, 2);
        assert_eq!(summary.tests_passed(), 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].name, "two");
        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.exit_status(), 1);
    }

    #[test]
    fn test_clean_run_exits_zero() {
        let state = RunState::default();
        let mut aggregator = ResultAggregator::new(10);
        aggregator.record(&state, None, "one", &passed());
        let summary = aggregator.finish(&state);
        assert!(summary.success());
        assert_eq!(summary.exit_status(), 0);
        assert!(summary.results.is_empty());
    }

    #[test]
    fn test_render_sorted_keys() {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let rendered = render_error(&value, true);
        let a = rendered.find("\"a\"").unwrap();
        let b = rendered.find("\"b\"").unwrap();
        let c = rendered.find("\"c\"").unwrap();
        let d = rendered.find("\"d\"").unwrap();
        assert!(a < b);
        assert!(c < d);

        let unsorted = render_error(&value, false);
        assert!(unsorted.find("\"b\"").unwrap() < unsorted.find("\"a\"").unwrap());
    }

    #[test]
    fn test_console_output() {
        colored::control::set_override(false);
        let mut reporter = ConsoleReporter::new(Vec::new(), false);
        reporter.report(&Event::GroupStart {
            label: "math.test".to_string(),
        });
        reporter.report(&Event::TestResult {
            name: "adds".to_string(),
            outcome: passed(),
        });
        reporter.report(&Event::TestResult {
            name: "subtracts".to_string(),
            outcome: failed(
                AssertionFailure::NotEqual {
                    expected: json!(1),
                    actual: json!(2),
                    info: Info::new(),
                }
                .into(),
            ),
        });
        reporter.report(&Event::GroupEnd);

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(output.contains("math.test\n"));
        assert!(output.contains("  ok adds\n"));
        assert!(output.contains("  FAIL subtracts\n"));
        assert!(output.contains("\"message\": \"not equal\""));
    }

    #[test]
    fn test_json_lines() {
        let mut reporter = JsonReporter::new(Vec::new());
        reporter.report(&Event::GroupStart {
            label: "a".to_string(),
        });
        reporter.report(&Event::TestResult {
            name: "t".to_string(),
            outcome: failed(Failure::Timeout { after_ms: 50 }),
        });
        reporter.report(&Event::GroupEnd);

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines[0], json!({"event": "group_start", "label": "a"}));
        assert_eq!(lines[1]["outcome"]["error"]["kind"], json!("timeout"));
        assert_eq!(
            lines[1]["outcome"]["error"]["message"],
            json!("timeout after 50ms")
        );
        assert_eq!(lines[2], json!({"event": "group_end"}));
    }
}
