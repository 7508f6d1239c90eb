//! The single active provider slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::ModelConfig;
use crate::provider::ProviderHandle;

/// Holds at most one ready provider. Only the orchestrator swaps it.
pub struct ActiveModelRegistry {
    active: RwLock<Option<Arc<ProviderHandle>>>,
    swaps: AtomicU64,
}

impl ActiveModelRegistry {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            swaps: AtomicU64::new(0),
        }
    }

    /// The current provider. Callers keep it alive across a swap.
    pub fn snapshot(&self) -> Option<Arc<ProviderHandle>> {
        self.active.read().clone()
    }

    pub fn active_config(&self) -> Option<ModelConfig> {
        self.active.read().as_ref().map(|h| h.config().clone())
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.read().as_ref().map(|h| h.name().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_none()
    }

    /// Times the slot changed hands.
    pub fn swap_count(&self) -> u64 {
        self.swaps.load(Ordering::SeqCst)
    }

    /// Install `handle`, returning whatever it replaced.
    pub(crate) fn install(&self, handle: Arc<ProviderHandle>) -> Option<Arc<ProviderHandle>> {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        self.active.write().replace(handle)
    }

    pub(crate) fn take(&self) -> Option<Arc<ProviderHandle>> {
        let taken = self.active.write().take();
        if taken.is_some() {
            self.swaps.fetch_add(1, Ordering::SeqCst);
        }
        taken
    }
}

impl Default for ActiveModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
