//! Routes a step to the execution context it asked for.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::config::SchedulerConfig;
use crate::core::delegate_queue::{DelegateQueue, QueueJob};
use crate::core::error::panic_message;
use crate::core::host::{ExecutionHost, Rejected};
use crate::core::signal::{SignalGuard, Step, StepSignal};
use crate::core::{ChainError, ExecutionContext, TickPhase};

/// The three tick-phase queues of one scheduler.
#[derive(Debug)]
pub struct TickQueues {
    early: DelegateQueue,
    fixed: DelegateQueue,
    late: DelegateQueue,
}

impl TickQueues {
    /// Build the queues from configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            early: DelegateQueue::from_config("early", &config.early),
            fixed: DelegateQueue::from_config("fixed", &config.fixed),
            late: DelegateQueue::from_config("late", &config.late),
        }
    }

    /// Queue for a phase.
    #[must_use]
    pub const fn get(&self, phase: TickPhase) -> &DelegateQueue {
        match phase {
            TickPhase::Early => &self.early,
            TickPhase::Fixed => &self.fixed,
            TickPhase::Late => &self.late,
        }
    }
}

/// Places steps on the host or a tick queue and normalizes their outcome.
///
/// Whatever the path, the step body runs under `catch_unwind`; a panic fails
/// the step through its guard so the chain always hears back.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    host: Arc<dyn ExecutionHost>,
    queues: Arc<TickQueues>,
}

impl Dispatcher {
    pub(crate) fn new(host: Arc<dyn ExecutionHost>, queues: Arc<TickQueues>) -> Self {
        Self { host, queues }
    }

    pub(crate) fn host(&self) -> &Arc<dyn ExecutionHost> {
        &self.host
    }

    pub(crate) fn queues(&self) -> &TickQueues {
        &self.queues
    }

    pub(crate) fn dispatch(
        &self,
        context: ExecutionContext,
        step: Step,
        signal: StepSignal,
        guard: SignalGuard,
    ) {
        debug!(step = %guard.label(), context = context.as_str(), "dispatching step");

        match context {
            ExecutionContext::Unconstrained => run_guarded(step, signal, guard),
            ExecutionContext::EnsureSingleThread if self.host.is_coordination_context() => {
                run_guarded(step, signal, guard);
            }
            ExecutionContext::ForceSingleThread | ExecutionContext::EnsureSingleThread => {
                let fallback = guard.clone();
                let job = Box::new(move || run_guarded(step, signal, guard));
                if let Err(rejected) = self.host.post_to_coordination(job) {
                    reject(&fallback, rejected);
                }
            }
            ExecutionContext::BackgroundThread => {
                let fallback = guard.clone();
                let job = Box::new(move || run_guarded(step, signal, guard));
                if let Err(rejected) = self.host.spawn_background(job) {
                    reject(&fallback, rejected);
                }
            }
            ExecutionContext::Tick(phase) => {
                let name = guard.label().to_owned();
                self.queues
                    .get(phase)
                    .enqueue(QueueJob::new(move || run_guarded(step, signal, guard)).named(name));
            }
        }
    }
}

fn run_guarded(step: Step, signal: StepSignal, guard: SignalGuard) {
    let result = {
        let _scope = guard.enter();
        catch_unwind(AssertUnwindSafe(move || step.invoke(signal)))
    };
    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        error!(step = %guard.label(), panic = %message, "step panicked");
        guard.fail(ChainError::StepPanicked {
            label: guard.label().to_owned(),
            message,
        });
    }
}

fn reject<T>(guard: &SignalGuard, rejected: Rejected<T>) {
    error!(step = %guard.label(), reason = %rejected.reason, "host refused step");
    guard.fail(ChainError::HostUnavailable(rejected.reason));
    // The signal inside the payload is already settled; dropping it is silent.
    drop(rejected.payload);
}
