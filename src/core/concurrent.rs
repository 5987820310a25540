//! Unordered step batch: all steps launch together, first failure wins.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::dispatcher::Dispatcher;
use crate::core::error::panic_message;
use crate::core::sequential::Predicate;
use crate::core::signal::{Resolver, Step, StepSignal};
use crate::core::{ChainError, ExecutionContext};

/// What a single step report means for the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchEvent {
    /// Last outstanding step completed with no failures.
    AllComplete,
    /// First failure of the batch.
    FirstFailure,
    /// The abort condition held at this completion.
    Aborted,
    /// Still waiting on other steps.
    Pending,
    /// The batch is already terminal; the report is discarded.
    Ignored,
    /// The step had already reported.
    DoubleSignal,
}

struct BatchEntry {
    step: Step,
    context: ExecutionContext,
}

pub(crate) struct ConcurrentContainer {
    slots: Vec<Mutex<Option<BatchEntry>>>,
    settled: Vec<AtomicBool>,
    started: AtomicBool,
    incomplete: AtomicUsize,
    failed: AtomicUsize,
    terminal: AtomicBool,
    abort_condition: Option<Predicate>,
    abort_requested: AtomicBool,
}

impl ConcurrentContainer {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            settled: Vec::new(),
            started: AtomicBool::new(false),
            incomplete: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            terminal: AtomicBool::new(false),
            abort_condition: None,
            abort_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.slots.push(Mutex::new(Some(BatchEntry {
            step,
            context: ExecutionContext::default(),
        })));
        self.settled.push(AtomicBool::new(false));
    }

    /// Set the context of the most recently pushed step. Returns `false` when empty.
    pub(crate) fn set_last_context(&mut self, context: ExecutionContext) -> bool {
        match self.slots.last_mut().and_then(|slot| slot.get_mut().as_mut()) {
            Some(entry) => {
                entry.context = context;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_abort_condition(&mut self, predicate: Predicate) -> bool {
        if self.abort_condition.is_some() {
            return false;
        }
        self.abort_condition = Some(predicate);
        true
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub(crate) fn failures(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Dispatch every step. Stops early once the batch turns terminal.
    ///
    /// Returns how many steps were dispatched.
    pub(crate) fn launch<R>(&self, dispatcher: &Dispatcher, mut make_resolver: R) -> Result<usize, ChainError>
    where
        R: FnMut(usize, &str) -> Resolver,
    {
        if self.slots.is_empty() {
            return Err(ChainError::EmptyChain("concurrent batch has no steps".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ChainError::Disposed("concurrent batch already launched".into()));
        }

        self.incomplete.store(self.slots.len(), Ordering::Release);

        let mut launched = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if self.is_terminal() {
                debug!(launched, total = self.slots.len(), "batch settled during launch; remaining steps skipped");
                break;
            }
            let Some(entry) = slot.lock().take() else {
                continue;
            };
            let label = entry.step.shared_label();
            let resolver = make_resolver(index, &label);
            let (signal, guard) = StepSignal::new(index, label, resolver);
            dispatcher.dispatch(entry.context, entry.step, signal, guard);
            launched += 1;
        }
        Ok(launched)
    }

    pub(crate) fn on_complete(&self, index: usize) -> BatchEvent {
        if !self.settle(index) {
            return BatchEvent::DoubleSignal;
        }
        if self.is_terminal() {
            return BatchEvent::Ignored;
        }

        let left = self.incomplete.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 && self.failures() == 0 {
            return self.seal(BatchEvent::AllComplete);
        }
        if self.should_abort() {
            return self.seal(BatchEvent::Aborted);
        }
        BatchEvent::Pending
    }

    pub(crate) fn on_failed(&self, index: usize) -> BatchEvent {
        if !self.settle(index) {
            return BatchEvent::DoubleSignal;
        }
        if self.failed.fetch_add(1, Ordering::AcqRel) == 0 {
            return self.seal(BatchEvent::FirstFailure);
        }
        BatchEvent::Ignored
    }

    fn seal(&self, event: BatchEvent) -> BatchEvent {
        if self.terminal.swap(true, Ordering::AcqRel) {
            BatchEvent::Ignored
        } else {
            event
        }
    }

    fn settle(&self, index: usize) -> bool {
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
