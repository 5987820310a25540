//! Registry of running chains, used by `abort_all`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// A running chain that can be aborted cooperatively.
pub trait Abortable: Send + Sync {
    /// Request an abort; it takes effect at the next step boundary.
    fn abort(&self);

    /// Chain name including its unique suffix.
    fn name(&self) -> &str;

    /// Whether the chain reached its terminal state.
    fn is_finished(&self) -> bool;
}

/// Weak handles to every live chain of one scheduler.
///
/// Chains register on `run` and deregister when they finish. Holding only
/// weak handles means the registry never keeps a chain alive.
#[derive(Default)]
pub struct AbortRegistry {
    chains: Mutex<HashMap<Uuid, Weak<dyn Abortable>>>,
}

impl AbortRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a running chain.
    pub fn register(&self, id: Uuid, chain: Weak<dyn Abortable>) {
        self.chains.lock().insert(id, chain);
    }

    /// Stop tracking a chain. Returns whether it was tracked.
    pub fn deregister(&self, id: &Uuid) -> bool {
        self.chains.lock().remove(id).is_some()
    }

    /// Abort every tracked chain that is still running. Returns how many were asked.
    pub fn abort_all(&self) -> usize {
        let live: Vec<Arc<dyn Abortable>> = {
            let mut chains = self.chains.lock();
            chains.retain(|_, chain| chain.strong_count() > 0);
            chains.values().filter_map(Weak::upgrade).collect()
        };

        let mut aborted = 0;
        for chain in live.iter().filter(|chain| !chain.is_finished()) {
            debug!(chain = %chain.name(), "aborting chain");
            chain.abort();
            aborted += 1;
        }
        info!(aborted, "abort_all requested");
        aborted
    }

    /// Number of tracked chains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    /// Whether no chains are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }
}

impl std::fmt::Debug for AbortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortRegistry")
            .field("chains", &self.len())
            .finish()
    }
}
