use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};

type Registry = Mutex<HashMap<u64, CancelToken>>;

/// Spawns the dedicated thread of every stage and tracks the topologies it
/// runs, so that they can all be cancelled when the executor shuts down.
#[derive(Debug)]
pub struct Executor {
    name: String,
    spawned: AtomicU64,
    shut_down: AtomicBool,
    next_id: AtomicU64,
    topologies: Arc<Registry>,
}

impl Executor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spawned: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            topologies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a named stage thread
    pub fn spawn<F, R>(&self, stage: String, f: F) -> Result<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(PipelineError::ExecutorShutDown);
        }

        let handle = thread::Builder::new()
            .name(format!("{}/{}", self.name, stage))
            .spawn(f)
            .map_err(|source| PipelineError::Spawn { stage, source })?;

        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Track a topology's cancel token so that [`Executor::cancel_all`]
    /// reaches it. The token stays tracked until the returned
    /// [`Registration`] is dropped.
    pub fn register(&self, cancel: &CancelToken) -> Result<Registration> {
        let mut topologies = self.topologies.lock();
        if self.is_shut_down() {
            return Err(PipelineError::ExecutorShutDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        topologies.insert(id, cancel.clone());
        Ok(Registration {
            id,
            registry: Arc::downgrade(&self.topologies),
        })
    }

    pub fn cancel_all(&self) {
        for (_, token) in self.topologies.lock().drain() {
            token.cancel();
        }
    }

    /// Number of topologies currently tracked
    pub fn registered(&self) -> usize {
        self.topologies.lock().len()
    }

    /// Refuse further work and cancel every topology still registered.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.cancel_all();
            debug!(executor = %self.name, threads = self.spawned(), "executor shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Total number of stage threads spawned so far
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps a topology reachable by [`Executor::cancel_all`]; dropping it
/// forgets the topology without cancelling it
#[derive(Debug)]
pub struct Registration {
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}
