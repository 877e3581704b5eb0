//! Timing schedules
//!
//! A schedule declares a sequence of events a test expects to observe, each at
//! an offset from the schedule's anchor. Every call to [`Schedule::step`]
//! consumes the next declared event (FIFO) and checks both the observed values
//! and the elapsed time, within a tolerance.
//!
//! With drift propagation enabled the anchor is moved by the deviation of each
//! observed step, so a late event does not make every later event late too.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{TestResult, TimingFailure};

/// Default allowed deviation between expected and observed time.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(20);

/// An expected or observed event: time offset in milliseconds plus values.
///
/// Serializes as `[at_ms, ...values]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub at_ms: u64,
    pub values: Vec<Value>,
}

impl Step {
    pub fn new(at_ms: u64, values: Vec<Value>) -> Self {
        Self { at_ms, values }
    }

    /// Declare an expected step at `at_ms` carrying `values`.
    pub fn at<I, V>(at_ms: u64, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(at_ms, values.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len() + 1))?;
        seq.serialize_element(&self.at_ms)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

/// Schedule tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Maximum allowed |elapsed - expected|
    pub tolerance: Duration,
    /// Move the anchor by the observed drift after every step
    pub propagate: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            propagate: true,
        }
    }
}

impl ScheduleOptions {
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }
}

#[derive(Debug)]
struct ScheduleState {
    expected: VecDeque<Step>,
    anchor: Instant,
    /// Early drift absorbed so far; time since `anchor` is reported this much later.
    lead: Duration,
    options: ScheduleOptions,
}

/// Handle to a declared schedule.
///
/// Cheap to clone; clones share the same expectation queue and anchor so a
/// schedule can be moved into timers or background tasks.
#[derive(Debug, Clone)]
pub struct Schedule {
    state: Arc<Mutex<ScheduleState>>,
}

impl Schedule {
    /// Create a schedule anchored at the current instant.
    pub fn new(steps: impl IntoIterator<Item = Step>, options: ScheduleOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScheduleState {
                expected: steps.into_iter().collect(),
                anchor: Instant::now(),
                lead: Duration::ZERO,
                options,
            })),
        }
    }

    /// Reset the anchor to now.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.anchor = Instant::now();
        state.lead = Duration::ZERO;
    }

    /// Record an observed event and verify it against the next expected step.
    pub fn step<I, V>(&self, values: I) -> TestResult
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.observe(Instant::now(), values)
    }

    /// Record an observed event that carries no values.
    pub fn tick(&self) -> TestResult {
        self.observe(Instant::now(), Vec::new())
    }

    fn observe(&self, now: Instant, values: Vec<Value>) -> TestResult {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.anchor) + state.lead;
        let actual = Step::new(elapsed.as_millis() as u64, values);

        let Some(expected) = state.expected.pop_front() else {
            return Err(TimingFailure::NoStepsLeft { actual }.into());
        };

        if expected.values != actual.values {
            return Err(TimingFailure::UnexpectedStep { expected, actual }.into());
        }

        let expected_at = Duration::from_millis(expected.at_ms);
        let late = elapsed > expected_at;
        let drift = if late {
            elapsed - expected_at
        } else {
            expected_at - elapsed
        };
        if drift > state.options.tolerance {
            return Err(TimingFailure::BadTiming {
                expected,
                actual,
                tolerance_ms: state.options.tolerance.as_millis() as u64,
            }
            .into());
        }

        if state.options.propagate {
            // Shift the timeline by the drift so this step counts as on time.
            // Moving the anchor forward consumes lead first, so it never passes `now`.
            if !late {
                state.lead += drift;
            } else if drift <= state.lead {
                state.lead -= drift;
            } else {
                let lead = state.lead;
                state.anchor += drift - lead;
                state.lead = Duration::ZERO;
            }
        }

        Ok(())
    }

    /// Expected steps that have not been observed yet.
    pub fn remaining(&self) -> Vec<Step> {
        self.state.lock().expected.iter().cloned().collect()
    }

    /// Fails with `missed steps` if any expected step was never observed.
    pub fn finish(&self) -> TestResult {
        let remaining = self.remaining();
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(TimingFailure::MissedSteps { remaining }.into())
        }
    }
}
