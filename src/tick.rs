//! Fixed-interval pulse generator used to cap the emission rate.

use crossbeam::channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::executor::Executor;
use crate::observe::SharedObserver;

/// A payload-free pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Index of the period boundary this tick belongs to
    pub seq: u64,
    /// When the tick was actually fired
    pub at: Instant,
}

/// Counters shared between a gate and whoever reports on it
#[derive(Debug, Default)]
pub struct TickStats {
    fired: AtomicU64,
    expired: AtomicU64,
}

impl TickStats {
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Ticks discarded unpaired, including skipped boundaries
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

/// Timing of a tick gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    pub period: Duration,
    pub initial_delay: Duration,
}

impl TickConfig {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(PipelineError::ConfigError(
                "tick period must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Instant of boundary `k`, measured from `origin` (which already
    /// includes the initial delay)
    fn boundary(&self, origin: Instant, k: u64) -> Instant {
        let nanos = (self.period.as_nanos() as u64).saturating_mul(k);
        origin + Duration::from_nanos(nanos)
    }

    /// Boundary to wait for after firing boundary `fired`, and how many
    /// boundaries are skipped because `now` is more than a period past them
    fn next_boundary(&self, origin: Instant, fired: u64, now: Instant) -> (u64, u64) {
        let next = fired + 1;
        if now <= self.boundary(origin, next) + self.period {
            return (next, 0);
        }
        let passed = ((now - origin).as_nanos() / self.period.as_nanos()) as u64;
        (passed + 1, passed - fired)
    }
}

/// Handle on a running gate thread
#[derive(Debug)]
pub struct TickGate {
    stop: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TickStats>,
}

impl TickGate {
    /// Spawn a gate; the returned receiver holds at most one pending tick
    pub fn start(
        executor: &Executor,
        name: &str,
        config: TickConfig,
        cancel: &CancelToken,
        observer: SharedObserver,
    ) -> Result<(TickGate, Receiver<Tick>)> {
        config.validate()?;

        let (tx, rx) = bounded(1);
        let stop = CancelToken::new();
        let stats = Arc::new(TickStats::default());

        let worker = GateWorker {
            config,
            tx,
            expire: rx.clone(),
            stop: stop.clone(),
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            observer,
            topology: name.to_string(),
        };
        let handle = executor.spawn(format!("{}-tick-gate", name), move || worker.run())?;

        let gate = TickGate {
            stop,
            handle: Mutex::new(Some(handle)),
            stats,
        };
        Ok((gate, rx))
    }

    /// Stop the gate and wait for its thread. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> Arc<TickStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for TickGate {
    fn drop(&mut self) {
        self.stop();
    }
}

struct GateWorker {
    config: TickConfig,
    tx: Sender<Tick>,
    expire: Receiver<Tick>,
    stop: CancelToken,
    cancel: CancelToken,
    stats: Arc<TickStats>,
    observer: SharedObserver,
    topology: String,
}

impl GateWorker {
    fn run(self) {
        let origin = Instant::now() + self.config.initial_delay;
        let mut k: u64 = 0;
        debug!(period = ?self.config.period, "tick gate started");

        loop {
            let wait = self
                .config
                .boundary(origin, k)
                .saturating_duration_since(Instant::now());
            select! {
                recv(self.stop.signal()) -> _ => break,
                recv(self.cancel.signal()) -> _ => break,
                default(wait) => {}
            }

            self.fire(Tick {
                seq: k,
                at: Instant::now(),
            });

            // Anchored to origin: a late wake-up never shifts later boundaries.
            let (next, skipped) = self.config.next_boundary(origin, k, Instant::now());
            if skipped > 0 {
                self.stats.expired.fetch_add(skipped, Ordering::Relaxed);
                trace!(skipped, "tick gate fell behind");
            }
            k = next;
        }
        debug!(fired = self.stats.fired(), expired = self.stats.expired(), "tick gate stopped");
    }

    fn fire(&self, tick: Tick) {
        self.stats.fired.fetch_add(1, Ordering::Relaxed);
        if let Err(TrySendError::Full(tick)) = self.tx.try_send(tick) {
            // The previous tick was never paired; replace it.
            if self.expire.try_recv().is_ok() {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .record_counter(&format!("{}.tick_gate.expired", self.topology));
            }
            let _ = self.tx.try_send(tick);
        }
    }
}

/// The tick stream consumed by a rate limiter: either a live gate or a
/// hand-driven channel.
#[derive(Debug)]
pub struct Ticks {
    rx: Receiver<Tick>,
    gate: Option<TickGate>,
}

impl Ticks {
    pub fn from_gate(gate: TickGate, rx: Receiver<Tick>) -> Self {
        Self {
            rx,
            gate: Some(gate),
        }
    }

    /// Ticks fed by hand, e.g. a synthetic clock in tests
    pub fn manual() -> (Sender<Tick>, Ticks) {
        let (tx, rx) = bounded(1);
        (tx, Ticks { rx, gate: None })
    }

    pub fn receiver(&self) -> &Receiver<Tick> {
        &self.rx
    }

    /// Wait for the next tick; `None` once the tick source is gone
    pub fn next(&self, cancel: &CancelToken) -> Result<Option<Tick>> {
        select! {
            recv(self.rx) -> tick => match tick {
                Ok(tick) => Ok(Some(tick)),
                // A gate stopped by cancellation closes its channel too.
                Err(_) => cancel.check().map(|()| None),
            },
            recv(cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }

    pub fn stop(&self) {
        if let Some(gate) = &self.gate {
            gate.stop();
        }
    }
}
