//! Best-effort background warm-up of fallback candidates.
//!
//! Warm handles are initialized but inactive. The orchestrator may adopt
//! one on a later `load`; nothing here touches the active registry or the
//! failure ledger, and every error ends up in [`PreloadErrorLog`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{name_key, BackendType, ModelConfig};
use crate::provider::{ProviderFactory, ProviderHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadFailure {
    pub model: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Bounded ring of recent warm-up failures; oldest entries fall off.
pub struct PreloadErrorLog {
    entries: Mutex<VecDeque<PreloadFailure>>,
    capacity: usize,
}

impl PreloadErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, model: &str, error: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(PreloadFailure {
            model: model.to_string(),
            error: error.into(),
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<PreloadFailure> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct WarmupPool {
    factory: ProviderFactory,
    capacity: usize,
    warm: Mutex<HashMap<String, Arc<ProviderHandle>>>,
    pending: Mutex<HashSet<String>>,
    errors: PreloadErrorLog,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WarmupPool {
    pub fn new(factory: ProviderFactory, capacity: usize, error_capacity: usize) -> Self {
        Self {
            factory,
            capacity,
            warm: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            errors: PreloadErrorLog::new(error_capacity),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue candidates for warm-up in one supervised task. Candidates
    /// beyond the free capacity are dropped. Server-backed entries are not
    /// warmed since their server would hold the shared port.
    pub fn schedule(self: &Arc<Self>, candidates: Vec<ModelConfig>) {
        let mut batch = Vec::new();
        {
            let warm = self.warm.lock();
            let mut pending = self.pending.lock();
            let mut free = self.capacity.saturating_sub(warm.len() + pending.len());
            for candidate in candidates {
                if free == 0 {
                    break;
                }
                let key = candidate.key();
                if candidate.backend_type == BackendType::Server
                    || warm.contains_key(&key)
                    || !pending.insert(key)
                {
                    continue;
                }
                free -= 1;
                batch.push(candidate);
            }
        }
        if batch.is_empty() {
            return;
        }

        debug!(count = batch.len(), "Scheduling warm-up");
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            for config in batch {
                pool.warm_one(config).await;
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Warm-up tasks still tracked for `wait_idle` and `clear`.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    async fn warm_one(&self, config: ModelConfig) {
        let key = config.key();
        let handle = Arc::new(self.factory.build(&config, config.backend_type));
        let outcome = AssertUnwindSafe(handle.initialize()).catch_unwind().await;
        self.pending.lock().remove(&key);

        match outcome {
            Ok(Ok(())) => {
                let admitted = {
                    let mut warm = self.warm.lock();
                    if warm.len() < self.capacity {
                        warm.insert(key, Arc::clone(&handle));
                        true
                    } else {
                        false
                    }
                };
                if admitted {
                    info!(model = %config.name, "Warm-up ready");
                } else {
                    handle.cleanup().await;
                }
            }
            Ok(Err(e)) => {
                warn!(model = %config.name, error = %e, "Warm-up failed");
                self.errors.push(&config.name, e.to_string());
                handle.cleanup().await;
            }
            Err(_) => {
                warn!(model = %config.name, "Warm-up panicked");
                self.errors.push(&config.name, "initialization panicked");
            }
        }
    }

    /// Remove and return the warm handle for `name`.
    pub fn take(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.warm.lock().remove(&name_key(name))
    }

    pub fn warm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .warm
            .lock()
            .values()
            .map(|h| h.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn errors(&self) -> Vec<PreloadFailure> {
        self.errors.snapshot()
    }

    /// Wait for every scheduled warm-up task to finish.
    pub async fn wait_idle(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Warm-up task aborted");
            }
        }
    }

    /// Stop pending work and release every warm handle.
    pub async fn clear(&self) {
        for task in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }
        self.pending.lock().clear();
        let handles: Vec<Arc<ProviderHandle>> = self.warm.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cleanup().await;
        }
    }
}
