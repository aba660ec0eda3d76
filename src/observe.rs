//! Observability collaborator interface.
//!
//! Stages report production, consumption, drop and completion events through
//! an [`Observer`]. Calls are fire-and-forget: implementations must return
//! quickly and must never fail the pipeline.

use std::sync::Arc;
use std::time::Duration;

/// Counter/timer/log sink the pipeline calls into
pub trait Observer: Send + Sync {
    fn record_counter(&self, name: &str);

    fn record_timing(&self, name: &str, duration: Duration);

    fn log(&self, message: &str);
}

/// Observer shared between stages
pub type SharedObserver = Arc<dyn Observer>;

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record_counter(&self, _name: &str) {}

    fn record_timing(&self, _name: &str, _duration: Duration) {}

    fn log(&self, _message: &str) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record_counter(&self, name: &str) {
        tracing::trace!(counter = name, "count");
    }

    fn record_timing(&self, name: &str, duration: Duration) {
        tracing::trace!(timer = name, micros = duration.as_micros() as u64, "timing");
    }

    fn log(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

/// Sends every event to each of the wrapped observers
#[derive(Clone, Default)]
pub struct Fanout {
    observers: Vec<SharedObserver>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: SharedObserver) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for Fanout {
    fn record_counter(&self, name: &str) {
        for observer in &self.observers {
            observer.record_counter(name);
        }
    }

    fn record_timing(&self, name: &str, duration: Duration) {
        for observer in &self.observers {
            observer.record_timing(name, duration);
        }
    }

    fn log(&self, message: &str) {
        for observer in &self.observers {
            observer.log(message);
        }
    }
}
