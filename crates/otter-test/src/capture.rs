//! Capture of failures that escape a test body
//!
//! Failures that do not travel through the body's own return value (a
//! background task that errors or panics, or a callback holding a
//! [`CaptureSink`]) are delivered to the [`ErrorCapture`] slot of the executor while the test that
//! caused them is running.
//!
//! The slot is installed for exactly one test at a time through a
//! [`CaptureGuard`], which uninstalls on drop. Every installation gets a new
//! generation, and sinks handed out during one installation stop recording as
//! soon as it ends, so late failures of a finished test never land on the next
//! one.
//!
//! A panic is only reported once it is known to have escaped: the body's own
//! panic is caught by the executor, and a background task's panic by
//! `TestContext::spawn`. Panics that code under test catches itself (through
//! `catch_unwind` or an awaited `JoinHandle`) never reach the slot.
//!
//! Panics expected by `throws*` assertions are caught inside a [`QuietPanics`]
//! scope, which keeps the process panic hook from printing them.

use std::cell::Cell;
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use crate::error::{Failure, Origin};

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    installed: bool,
    error: Option<Failure>,
}

/// Single-slot receiver for unexpected failures, owned by one executor.
#[derive(Debug, Clone, Default)]
pub struct ErrorCapture {
    slot: Arc<Mutex<Slot>>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start capturing for one test. Dropping the guard stops it.
    pub fn install(&self) -> CaptureGuard {
        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.installed = true;
            slot.error = None;
            slot.generation
        };
        let sink = CaptureSink {
            slot: Arc::clone(&self.slot),
            generation,
        };
        tracing::trace!(generation, "error capture installed");

        CaptureGuard { sink }
    }

    /// Whether a guard is currently alive.
    pub fn is_installed(&self) -> bool {
        self.slot.lock().installed
    }
}

/// Handle used to deliver failures into the capture of one test.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    slot: Arc<Mutex<Slot>>,
    generation: u64,
}

impl CaptureSink {
    /// Record `failure` if this sink's installation is still active and nothing
    /// has been recorded yet. Returns whether it was recorded.
    pub fn report(&self, failure: Failure) -> bool {
        let mut slot = self.slot.lock();
        if !slot.installed || slot.generation != self.generation {
            tracing::debug!(%failure, "dropping failure reported after its test finished");
            return false;
        }
        if slot.error.is_some() {
            return false;
        }
        slot.error = Some(failure);
        true
    }

    /// Report an error message on behalf of a callback.
    pub fn report_error(&self, error: impl std::fmt::Display) -> bool {
        self.report(Failure::Unexpected {
            origin: Origin::Report,
            message: error.to_string(),
        })
    }
}

/// Scope of one capture installation.
#[derive(Debug)]
pub struct CaptureGuard {
    sink: CaptureSink,
}

impl CaptureGuard {
    /// Sink bound to this installation.
    pub fn sink(&self) -> CaptureSink {
        self.sink.clone()
    }

    /// Take the failure recorded so far, if any.
    pub fn take(&self) -> Option<Failure> {
        let mut slot = self.sink.slot.lock();
        if slot.generation == self.sink.generation {
            slot.error.take()
        } else {
            None
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        {
            let mut slot = self.sink.slot.lock();
            if slot.generation == self.sink.generation {
                slot.installed = false;
                slot.error = None;
            }
        }
        tracing::trace!(generation = self.sink.generation, "error capture uninstalled");
    }
}

thread_local! {
    static QUIET: Cell<usize> = const { Cell::new(0) };
}

static PANIC_HOOK: Once = Once::new();

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !panics_are_quiet() {
                previous(info);
            }
        }));
    });
}

fn panics_are_quiet() -> bool {
    QUIET.try_with(Cell::get).unwrap_or(0) > 0
}

/// Extract a readable message from a panic payload.
pub(crate) fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// While alive, panics on this thread are expected by the caller and are not
/// printed. Never hold one across an `.await`; see [`quiet_poll`].
pub(crate) struct QuietPanics(());

impl QuietPanics {
    pub(crate) fn enter() -> Self {
        install_panic_hook();
        QUIET.with(|q| q.set(q.get() + 1));
        Self(())
    }
}

impl Drop for QuietPanics {
    fn drop(&mut self) {
        let _ = QUIET.try_with(|q| q.set(q.get().saturating_sub(1)));
    }
}

/// Drive `future` with panics quiet only while it is being polled, so other
/// tasks interleaved at its await points keep their panic output.
pub(crate) async fn quiet_poll<F: Future>(future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    std::future::poll_fn(|cx| {
        let _quiet = QuietPanics::enter();
        future.as_mut().poll(cx)
    })
    .await
}
