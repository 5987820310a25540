//! Ordered step container with a single in-flight step.
//!
//! The container only knows how to hand out the next step; the owning
//! [`SequentialAction`](crate::core::SequentialAction) drives it and decides
//! what a chain does with each [`Advance`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::core::dispatcher::Dispatcher;
use crate::core::error::panic_message;
use crate::core::signal::{Resolver, Step, StepSignal};
use crate::core::{ChainError, ExecutionContext};

/// Boxed predicate used for skip and abort conditions.
pub(crate) type Predicate = Box<dyn Fn() -> bool + Send + Sync + 'static>;

pub(crate) struct StepEntry {
    pub(crate) step: Step,
    pub(crate) context: ExecutionContext,
    pub(crate) skip: Option<Predicate>,
}

/// Result of one [`SequentialContainer::try_advance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Advance {
    /// The step at this index was handed to the dispatcher.
    Dispatched(usize),
    /// The step's skip condition held; it counts as completed.
    Skipped(usize),
    /// No steps remain.
    Exhausted,
    /// The abort condition held before this step dispatched.
    Aborted(usize),
    /// Evaluating the step's skip condition panicked.
    Failed(usize, ChainError),
    /// The container was already aborted; nothing happened.
    Halted,
}

pub(crate) struct SequentialContainer {
    slots: Vec<Mutex<Option<StepEntry>>>,
    settled: Vec<AtomicBool>,
    cursor: AtomicI64,
    abort_condition: Option<Predicate>,
    abort_requested: AtomicBool,
    aborted: AtomicBool,
}

impl SequentialContainer {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            settled: Vec::new(),
            cursor: AtomicI64::new(-1),
            abort_condition: None,
            abort_requested: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.slots.push(Mutex::new(Some(StepEntry {
            step,
            context: ExecutionContext::default(),
            skip: None,
        })));
        self.settled.push(AtomicBool::new(false));
    }

    /// Mutate the most recently pushed entry. Returns `false` when empty.
    pub(crate) fn with_last(&mut self, f: impl FnOnce(&mut StepEntry)) -> bool {
        match self.slots.last_mut().and_then(|slot| slot.get_mut().as_mut()) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Set the abort predicate. Returns `false` if one is already set.
    pub(crate) fn set_abort_condition(&mut self, predicate: Predicate) -> bool {
        if self.abort_condition.is_some() {
            return false;
        }
        self.abort_condition = Some(predicate);
        true
    }

    /// Make the next advance abort.
    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Move to the next step and dispatch it.
    ///
    /// `make_resolver` is called with the step's index and label right before
    /// dispatch and must return the callback that receives its outcome.
    pub(crate) fn try_advance<R>(&self, dispatcher: &Dispatcher, make_resolver: R) -> Advance
    where
        R: FnOnce(usize, &str) -> Resolver,
    {
        if self.is_aborted() {
            error!("advance requested on an aborted sequence. PLEASE REPORT BUG WITH FULL LOG");
            return Advance::Halted;
        }

        let next = self.cursor.fetch_add(1, Ordering::AcqRel) + 1;
        let index = match usize::try_from(next) {
            Ok(index) if index < self.slots.len() => index,
            _ => return Advance::Exhausted,
        };

        if self.should_abort() {
            self.aborted.store(true, Ordering::Release);
            return Advance::Aborted(index);
        }

        let Some(entry) = self.slots[index].lock().take() else {
            error!(step = index, "step slot already consumed. PLEASE REPORT BUG WITH FULL LOG");
            return Advance::Halted;
        };

        if let Some(skip) = &entry.skip {
            match catch_unwind(AssertUnwindSafe(|| skip())) {
                Ok(true) => {
                    self.settled[index].store(true, Ordering::Release);
                    return Advance::Skipped(index);
                }
                Ok(false) => {}
                Err(payload) => {
                    self.settled[index].store(true, Ordering::Release);
                    let message = panic_message(payload.as_ref());
                    error!(step = index, label = %entry.step.label(), panic = %message, "skip condition panicked");
                    return Advance::Failed(
                        index,
                        ChainError::StepPanicked {
                            label: entry.step.label().to_owned(),
                            message,
                        },
                    );
                }
            }
        }

        let label = entry.step.shared_label();
        let resolver = make_resolver(index, &label);
        let (signal, guard) = StepSignal::new(index, label, resolver);
        dispatcher.dispatch(entry.context, entry.step, signal, guard);
        Advance::Dispatched(index)
    }

    /// Record that step `index` reported. Returns `false` on a duplicate report.
    pub(crate) fn settle(&self, index: usize) -> bool {
        self.settled
            .get(index)
            .is_some_and(|flag| !flag.swap(true, Ordering::AcqRel))
    }

    fn should_abort(&self) -> bool {
        if self.abort_requested.load(Ordering::Acquire) {
            return true;
        }
        let Some(condition) = &self.abort_condition else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| condition())) {
            Ok(abort) => abort,
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "abort condition panicked; aborting");
                true
            }
        }
    }
}
