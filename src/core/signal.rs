//! Steps and the single-use signals they resolve.
//!
//! A [`Step`] is an opaque unit of work that receives a [`StepSignal`] and must
//! resolve it exactly once, by calling [`StepSignal::complete`] or
//! [`StepSignal::fail`]. Both consume the signal, so a well-typed step cannot
//! resolve twice. A signal dropped without resolving fails its step with
//! [`ChainError::SignalDropped`]; one dropped by a panicking thread fails it
//! with [`ChainError::StepPanicked`].

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::ChainError;

/// Final state reported by one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step finished its work.
    Completed,
    /// The step failed.
    Failed(ChainError),
}

/// Callback receiving a step's outcome.
pub(crate) type Resolver = Box<dyn FnOnce(StepOutcome) + Send + 'static>;

static NEXT_SLOT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Slots whose step body is running under a `catch_unwind` on this thread.
    static GUARDED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_guarded_here(id: u64) -> bool {
    GUARDED
        .try_with(|guarded| guarded.borrow().contains(&id))
        .unwrap_or(false)
}

/// Shared resolution slot. The resolver is taken on first use.
struct SignalSlot {
    id: u64,
    resolver: Mutex<Option<Resolver>>,
}

impl SignalSlot {
    fn resolve(&self, outcome: StepOutcome) -> bool {
        let resolver = self.resolver.lock().take();
        match resolver {
            Some(resolver) => {
                resolver(outcome);
                true
            }
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        self.resolver.lock().is_some()
    }
}

/// Completion handle passed to a running step.
///
/// Resolving consumes the signal. It is `Send`, so it may be moved to another
/// thread and resolved there.
pub struct StepSignal {
    index: usize,
    label: Arc<str>,
    slot: Option<Arc<SignalSlot>>,
}

/// Dispatcher-side handle on the same slot, used to fail a step whose body
/// panicked before resolving.
#[derive(Clone)]
pub(crate) struct SignalGuard {
    label: Arc<str>,
    slot: Arc<SignalSlot>,
}

impl SignalGuard {
    /// Fail the step unless it already resolved. Returns whether this call resolved it.
    pub(crate) fn fail(&self, error: ChainError) -> bool {
        self.slot.resolve(StepOutcome::Failed(error))
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Mark this slot as guarded on the current thread until the scope drops.
    ///
    /// While the scope lives, a signal for this slot dropped during a panic is
    /// left pending so the caller can fail it with the panic message.
    pub(crate) fn enter(&self) -> GuardScope {
        let id = self.slot.id;
        GUARDED.with(|guarded| guarded.borrow_mut().push(id));
        GuardScope { id }
    }
}

/// Scope returned by [`SignalGuard::enter`].
pub(crate) struct GuardScope {
    id: u64,
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        let _ = GUARDED.try_with(|guarded| {
            let mut guarded = guarded.borrow_mut();
            if let Some(pos) = guarded.iter().rposition(|id| *id == self.id) {
                guarded.remove(pos);
            }
        });
    }
}

impl StepSignal {
    pub(crate) fn new(index: usize, label: Arc<str>, resolver: Resolver) -> (Self, SignalGuard) {
        let slot = Arc::new(SignalSlot {
            id: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
            resolver: Mutex::new(Some(resolver)),
        });
        let guard = SignalGuard {
            label: Arc::clone(&label),
            slot: Arc::clone(&slot),
        };
        (
            Self {
                index,
                label,
                slot: Some(slot),
            },
            guard,
        )
    }

    /// Position of the step inside its chain.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Registration label of the step.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signal successful completion.
    pub fn complete(mut self) {
        self.resolve(StepOutcome::Completed);
    }

    /// Signal failure with a reason.
    pub fn fail(mut self, reason: impl fmt::Display) {
        let error = ChainError::failed(self.index, reason);
        self.resolve(StepOutcome::Failed(error));
    }

    /// Signal failure with an existing error (used when forwarding nested chain failures).
    pub fn fail_with(mut self, error: ChainError) {
        self.resolve(StepOutcome::Failed(error));
    }

    /// Resolve from a `Result`: `Ok` completes, `Err` fails with its message.
    pub fn resolve_result<E: fmt::Display>(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.complete(),
            Err(e) => self.fail(e),
        }
    }

    fn resolve(&mut self, outcome: StepOutcome) {
        if let Some(slot) = self.slot.take() {
            if !slot.resolve(outcome) {
                tracing::debug!(step = %self.label, "signal resolved after its step was already settled");
            }
        }
    }
}

impl fmt::Debug for StepSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSignal")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("resolved", &self.slot.is_none())
            .finish()
    }
}

impl Drop for StepSignal {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if !slot.is_pending() {
            return;
        }
        if !std::thread::panicking() {
            tracing::warn!(step = %self.label, index = self.index, "step dropped its signal without resolving");
            slot.resolve(StepOutcome::Failed(ChainError::SignalDropped {
                label: self.label.to_string(),
            }));
            return;
        }
        // Inside a guarded body the guard reports the panic with its message.
        if is_guarded_here(slot.id) {
            return;
        }
        tracing::error!(step = %self.label, index = self.index, "signal dropped by a panicking thread");
        slot.resolve(StepOutcome::Failed(ChainError::StepPanicked {
            label: self.label.to_string(),
            message: String::from("signal dropped while its thread panicked"),
        }));
    }
}

type StepBody = Box<dyn FnOnce(StepSignal) + Send + 'static>;

/// A unit of work in a chain.
///
/// Built from one of several callable shapes; the label defaults to the
/// source location that created the step.
pub struct Step {
    label: Arc<str>,
    body: StepBody,
}

impl Step {
    /// Step with an explicit signal.
    #[track_caller]
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(StepSignal) + Send + 'static,
    {
        Self {
            label: caller_label(Location::caller()),
            body: Box::new(body),
        }
    }

    /// Step that completes as soon as the closure returns.
    ///
    /// Only use for plain calls: work the closure hands to other threads is
    /// not tracked.
    #[track_caller]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move |signal: StepSignal| {
            f();
            signal.complete();
        })
    }

    /// Step that completes on `Ok` and fails on `Err`.
    #[track_caller]
    pub fn from_result<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        Self::new(move |signal: StepSignal| signal.resolve_result(f()))
    }

    /// Replace the registration label.
    #[must_use]
    pub fn labeled(mut self, label: impl AsRef<str>) -> Self {
        self.label = Arc::from(label.as_ref());
        self
    }

    /// Registration label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn shared_label(&self) -> Arc<str> {
        Arc::clone(&self.label)
    }

    pub(crate) fn invoke(self, signal: StepSignal) {
        (self.body)(signal);
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Conversion into a [`Step`], implemented by steps and by both chain builders.
pub trait IntoStep {
    /// Convert into a step that resolves when the wrapped work finishes.
    fn into_step(self) -> Step;
}

impl IntoStep for Step {
    fn into_step(self) -> Step {
        self
    }
}

pub(crate) fn caller_label(location: &Location<'_>) -> Arc<str> {
    Arc::from(format!("{}:{}", location.file(), location.line()))
}
