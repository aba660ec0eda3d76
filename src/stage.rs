use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::observe::SharedObserver;

/// How a stage thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageExit {
    /// Input completed and completion was passed on
    Completed,
    /// A stream failure ended the stage; carries its message
    Failed(String),
    /// The topology was cancelled
    Cancelled,
    /// Every downstream consumer went away
    Detached,
}

/// Map the outcome of forwarding a terminal signal onto the stage's exit
pub(crate) fn forwarded(sent: Result<()>, exit: StageExit) -> StageExit {
    match sent {
        Ok(()) => exit,
        Err(PipelineError::Cancelled) => StageExit::Cancelled,
        Err(e) => StageExit::Failed(e.to_string()),
    }
}

/// Counters of the linear part of a topology
#[derive(Debug, Default)]
pub struct TopologyCounters {
    produced: AtomicU64,
    emitted: AtomicU64,
    forwarded: AtomicU64,
}

impl TopologyCounters {
    /// Items handed over by the producer
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Items released by the rate limiter
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Items replicated by the splitter
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub(crate) fn add_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// What every stage of one topology shares
#[derive(Clone)]
pub struct StageContext {
    pub topology: Arc<str>,
    pub cancel: CancelToken,
    pub observer: SharedObserver,
    pub counters: Arc<TopologyCounters>,
}

impl StageContext {
    pub fn new(topology: &str, cancel: CancelToken, observer: SharedObserver) -> Self {
        Self {
            topology: Arc::from(topology),
            cancel,
            observer,
            counters: Arc::new(TopologyCounters::default()),
        }
    }

    /// Increment `<topology>.<name>`
    pub fn count(&self, name: &str) {
        self.observer
            .record_counter(&format!("{}.{}", self.topology, name));
    }

    /// Record a timing under `<topology>.<name>`
    pub fn time(&self, name: &str, duration: Duration) {
        self.observer
            .record_timing(&format!("{}.{}", self.topology, name), duration);
    }

    pub fn log(&self, message: &str) {
        self.observer
            .log(&format!("[{}] {}", self.topology, message));
    }
}
