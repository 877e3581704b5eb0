//! Error types for otter-test
//!
//! [`Failure`] is what a single test produces when it does not pass. It is a
//! structured value: the reporter renders its fields, so every variant carries
//! only the data relevant to that kind of failure.
//!
//! [`RunnerError`] covers everything that goes wrong outside of a test body
//! (configuration, discovery, I/O).

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schedule::Step;

/// Caller-supplied fields attached to an assertion failure.
pub type Info = Map<String, Value>;

/// Result of a test body or of a single assertion.
pub type TestResult<T = ()> = Result<T, Failure>;

/// Why a test failed
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The test was registered without a body
    #[error("NOT IMPLEMENTED")]
    NotImplemented,

    /// An assertion made through the test context failed
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),

    /// A schedule observed the wrong event or the right event at the wrong time
    #[error(transparent)]
    Timing(#[from] TimingFailure),

    /// `expect(n)` was declared and a different number of assertions ran
    #[error("wrong number of assertions")]
    CountMismatch { expected: usize, actual: usize },

    /// The body did not settle within its timeout
    #[error("timeout after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// A failure the capture hook picked up outside the body's own control flow
    #[error("{message}")]
    Unexpected { origin: Origin, message: String },

    /// The body returned an error of its own
    #[error("{message}")]
    Thrown { message: String },

    /// The body panicked
    #[error("panicked: {message}")]
    Panicked { message: String },
}

/// Where an [`Failure::Unexpected`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A background task started with `TestContext::spawn` returned an error
    Task,
    /// A background task started with `TestContext::spawn` panicked
    Panic,
    /// Reported explicitly through a `CaptureSink`
    Report,
}

/// Failures raised by the assertion methods of `TestContext`
///
/// Caller-supplied `info` fields are merged into the serialized failure.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "assertion", rename_all = "snake_case")]
pub enum AssertionFailure {
    #[error("not ok")]
    NotOk {
        #[serde(flatten)]
        info: Info,
    },

    #[error("not equal")]
    NotEqual {
        expected: Value,
        actual: Value,
        #[serde(flatten)]
        info: Info,
    },

    #[error("did throw")]
    DidThrow {
        error: String,
        callback: String,
        #[serde(flatten)]
        info: Info,
    },

    #[error("didn't throw")]
    DidNotThrow {
        callback: String,
        #[serde(flatten)]
        info: Info,
    },

    #[error("failed")]
    Failed {
        #[serde(flatten)]
        info: Info,
    },
}

/// Failures raised by a schedule
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "timing", rename_all = "snake_case")]
pub enum TimingFailure {
    #[error("unexpected step")]
    UnexpectedStep { expected: Step, actual: Step },

    #[error("bad timing")]
    BadTiming {
        expected: Step,
        actual: Step,
        tolerance_ms: u64,
    },

    #[error("no steps left")]
    NoStepsLeft { actual: Step },

    #[error("missed steps")]
    MissedSteps { remaining: Vec<Step> },
}

impl Failure {
    /// Wrap any displayable error as the body's own failure.
    pub fn thrown(error: impl std::fmt::Display) -> Self {
        Self::Thrown {
            message: error.to_string(),
        }
    }

    /// Stable short name of the variant, used by reporters.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::NotImplemented => "not_implemented",
            Failure::Assertion(_) => "assertion",
            Failure::Timing(_) => "timing",
            Failure::CountMismatch { .. } => "count_mismatch",
            Failure::Timeout { .. } => "timeout",
            Failure::Unexpected { .. } => "unexpected",
            Failure::Thrown { .. } => "thrown",
            Failure::Panicked { .. } => "panicked",
        }
    }

    /// Structured form handed to reporters: the serialized fields plus the
    /// display message under `message`.
    pub fn to_value(&self) -> Value {
        let mut fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.insert("message".to_string(), Value::String(self.to_string()));
        Value::Object(fields)
    }
}

/// Configuration file could not be used
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// A file loader could not register the tests of a file
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid test file '{}': {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

/// Errors that stop a run before or outside test execution
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scheduler stopped unexpectedly: {0}")]
    Scheduler(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_messages() {
        assert_eq!(Failure::NotImplemented.to_string(), "NOT IMPLEMENTED");
        assert_eq!(
            Failure::from(AssertionFailure::NotOk { info: Info::new() }).to_string(),
            "not ok"
        );
        assert_eq!(
            Failure::CountMismatch {
                expected: 2,
                actual: 1
            }
            .to_string(),
            "wrong number of assertions"
        );
        assert_eq!(
            Failure::Timeout { after_ms: 50 }.to_string(),
            "timeout after 50ms"
        );
    }

    #[test]
    fn test_failure_value_is_tagged() {
        let failure = Failure::from(AssertionFailure::NotEqual {
            expected: json!(1),
            actual: json!(2),
            info: Info::new(),
        });
        assert_eq!(
            failure.to_value(),
            json!({
                "kind": "assertion",
                "assertion": "not_equal",
                "expected": 1,
                "actual": 2,
                "message": "not equal",
            })
        );
        assert_eq!(failure.kind(), "assertion");
    }

    #[test]
    fn test_info_fields_are_merged() {
        let mut info = Info::new();
        info.insert("input".to_string(), json!([1, 2]));
        let failure = Failure::from(AssertionFailure::NotOk { info });
        assert_eq!(
            failure.to_value(),
            json!({
                "kind": "assertion",
                "assertion": "not_ok",
                "input": [1, 2],
                "message": "not ok",
            })
        );
    }

    #[test]
    fn test_timing_value_uses_step_pairs() {
        let failure = Failure::from(TimingFailure::UnexpectedStep {
            expected: Step::new(0, vec![json!("x")]),
            actual: Step::new(1, vec![json!("z")]),
        });
        let value = failure.to_value();
        assert_eq!(value["expected"], json!([0, "x"]));
        assert_eq!(value["actual"], json!([1, "z"]));
        assert_eq!(value["message"], json!("unexpected step"));
    }
}
