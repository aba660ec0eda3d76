use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::buffer::{BoundedBranchBuffer, OverflowPolicy};
use crate::cancel::CancelToken;
use crate::consumer::{
    BranchReport, BranchSource, BranchState, Consumer, ConsumerActor, FailurePolicy,
};
use crate::delay::DelayModel;
use crate::error::{PipelineError, Result};
use crate::executor::{Executor, Registration};
use crate::limiter::RateLimiter;
use crate::link::link;
use crate::observe::SharedObserver;
use crate::producer::Producer;
use crate::splitter::{BranchPort, BroadcastSplitter};
use crate::stage::{StageContext, StageExit, TopologyCounters};
use crate::tick::{TickConfig, TickGate, TickStats, Ticks};

/// Tick period used when a topology does not declare one
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(200);

/// Capacity and overflow policy of a branch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

/// One declared branch: a consumer, its simulated latency and an optional
/// buffer in front of it
pub struct BranchSpec<T> {
    name: String,
    consumer: Box<dyn Consumer<T>>,
    delay: DelayModel,
    buffer: Option<BufferSpec>,
}

impl<T> BranchSpec<T> {
    pub fn new(name: impl Into<String>, consumer: impl Consumer<T>) -> Self {
        Self {
            name: name.into(),
            consumer: Box::new(consumer),
            delay: DelayModel::Zero,
            buffer: None,
        }
    }

    /// Simulated processing time per item
    pub fn with_delay(mut self, delay: DelayModel) -> Self {
        self.delay = delay;
        self
    }

    /// Put a bounded buffer between the splitter and the consumer
    pub fn with_buffer(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.buffer = Some(BufferSpec { capacity, policy });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> fmt::Debug for BranchSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchSpec")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Where a topology's ticks come from
#[derive(Debug)]
enum TickSource {
    Gate(TickConfig),
    Manual(Ticks),
}

/// Builder for constructing topologies
pub struct TopologyBuilder<T> {
    name: String,
    producer: Option<Producer<T>>,
    tick: TickConfig,
    manual_ticks: Option<Ticks>,
    branches: Vec<BranchSpec<T>>,
    failure_policy: FailurePolicy,
}

impl<T: Clone + Send + 'static> TopologyBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            producer: None,
            tick: TickConfig::new(DEFAULT_TICK_PERIOD),
            manual_ticks: None,
            branches: Vec::new(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn producer(mut self, producer: Producer<T>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Interval between ticks of the gate
    pub fn tick_period(mut self, period: Duration) -> Self {
        self.tick.period = period;
        self
    }

    /// Delay before the first tick
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.tick.initial_delay = delay;
        self
    }

    /// Drive the rate limiter from a hand-fed tick source instead of a gate
    pub fn manual_ticks(mut self, ticks: Ticks) -> Self {
        self.manual_ticks = Some(ticks);
        self
    }

    pub fn branch(mut self, branch: BranchSpec<T>) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Validate the declaration
    pub fn build(self) -> Result<Topology<T>> {
        let producer = self
            .producer
            .ok_or_else(|| PipelineError::NoProducer(self.name.clone()))?;
        if self.branches.is_empty() {
            return Err(PipelineError::NoBranches(self.name));
        }

        let mut names = HashSet::new();
        for branch in &self.branches {
            if !names.insert(branch.name.as_str()) {
                return Err(PipelineError::ConfigError(format!(
                    "duplicate branch '{}' in topology '{}'",
                    branch.name, self.name
                )));
            }
            if let Some(buffer) = branch.buffer {
                if buffer.capacity == 0 {
                    return Err(PipelineError::ConfigError(format!(
                        "branch '{}' buffer capacity must be at least 1",
                        branch.name
                    )));
                }
            }
        }

        let ticks = match self.manual_ticks {
            Some(ticks) => TickSource::Manual(ticks),
            None => {
                self.tick.validate()?;
                TickSource::Gate(self.tick)
            }
        };

        Ok(Topology {
            name: self.name,
            producer,
            ticks,
            branches: self.branches,
            failure_policy: self.failure_policy,
        })
    }
}

/// A validated, not yet started topology
pub struct Topology<T> {
    name: String,
    producer: Producer<T>,
    ticks: TickSource,
    branches: Vec<BranchSpec<T>>,
    failure_policy: FailurePolicy,
}

impl<T: Clone + Send + 'static> Topology<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fan-out degree
    pub fn degree(&self) -> usize {
        self.branches.len()
    }

    /// Wire every stage and start one thread per stage on `executor`.
    ///
    /// Consumers start first, the producer last. If a thread cannot be
    /// started the topology is cancelled, which unwinds the stages already
    /// running.
    pub fn spawn(self, executor: &Executor, observer: SharedObserver) -> Result<RunningTopology> {
        let cancel = CancelToken::new();
        let registration = executor.register(&cancel)?;

        let name = self.name.clone();
        let started = self.start(executor, &cancel, registration, observer);
        if started.is_err() {
            warn!(topology = %name, "topology failed to start, cancelling");
            cancel.cancel();
        }
        started
    }

    fn start(
        self,
        executor: &Executor,
        cancel: &CancelToken,
        registration: Registration,
        observer: SharedObserver,
    ) -> Result<RunningTopology> {
        let Topology {
            name,
            producer,
            ticks,
            branches,
            failure_policy,
        } = self;
        let ctx = StageContext::new(&name, cancel.clone(), observer.clone());

        let (ticks, tick_stats) = match ticks {
            TickSource::Gate(config) => {
                let (gate, rx) = TickGate::start(executor, &name, config, cancel, observer)?;
                let stats = gate.stats();
                (Ticks::from_gate(gate, rx), Some(stats))
            }
            TickSource::Manual(ticks) => (ticks, None),
        };

        let (producer_out, limiter_in) = link(cancel);
        let (limiter_out, splitter_in) = link(cancel);
        let mut splitter = BroadcastSplitter::new(splitter_in);

        let mut actors = Vec::with_capacity(branches.len());
        for branch in branches {
            let (port, source) = match branch.buffer {
                Some(spec) => {
                    let (writer, reader) =
                        BoundedBranchBuffer::channel(spec.capacity, spec.policy, cancel)?;
                    (BranchPort::Buffered(writer), BranchSource::Buffered(reader))
                }
                None => {
                    let (outlet, inlet) = link(cancel);
                    (BranchPort::Direct(outlet), BranchSource::Direct(inlet))
                }
            };
            splitter.add_branch(branch.name.clone(), port);
            let actor = ConsumerActor::new(branch.name, source, branch.consumer)
                .with_delay(branch.delay)
                .with_failure_policy(failure_policy);
            actors.push(actor);
        }

        let mut branch_handles = Vec::with_capacity(actors.len());
        for actor in actors {
            let branch = actor.name().to_string();
            let state = actor.state_handle();
            let stage_ctx = ctx.clone();
            let handle = executor.spawn(format!("{}-consumer-{}", name, branch), move || {
                actor.run(&stage_ctx)
            })?;
            branch_handles.push(BranchHandle {
                name: branch,
                state,
                handle,
            });
        }

        let mut stage_handles = Vec::with_capacity(3);
        let stage_ctx = ctx.clone();
        stage_handles.push((
            "splitter",
            executor.spawn(format!("{}-splitter", name), move || {
                splitter.run(&stage_ctx)
            })?,
        ));
        let stage_ctx = ctx.clone();
        let limiter = RateLimiter::new(limiter_in, ticks, limiter_out);
        stage_handles.push((
            "limiter",
            executor.spawn(format!("{}-limiter", name), move || {
                limiter.run(&stage_ctx)
            })?,
        ));
        let stage_ctx = ctx.clone();
        stage_handles.push((
            "producer",
            executor.spawn(format!("{}-producer", name), move || {
                producer.run(producer_out, &stage_ctx)
            })?,
        ));

        info!(topology = %name, branches = branch_handles.len(), "topology started");
        Ok(RunningTopology {
            name,
            cancel: cancel.clone(),
            registration,
            counters: Arc::clone(&ctx.counters),
            tick_stats,
            failure_policy,
            stages: stage_handles,
            branches: branch_handles,
            started: Instant::now(),
        })
    }
}

impl<T> fmt::Debug for Topology<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("name", &self.name)
            .field("ticks", &self.ticks)
            .field("branches", &self.branches)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct BranchHandle {
    name: String,
    state: Arc<Mutex<BranchState>>,
    handle: JoinHandle<BranchReport>,
}

/// A started topology that can be monitored, cancelled and waited
#[derive(Debug)]
pub struct RunningTopology {
    name: String,
    cancel: CancelToken,
    registration: Registration,
    counters: Arc<TopologyCounters>,
    tick_stats: Option<Arc<TickStats>>,
    failure_policy: FailurePolicy,
    stages: Vec<(&'static str, JoinHandle<StageExit>)>,
    branches: Vec<BranchHandle>,
    started: Instant,
}

impl RunningTopology {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation; every stage unwinds and in-flight items are
    /// discarded. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(topology = %self.name, "cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.stages.iter().all(|(_, h)| h.is_finished())
            && self.branches.iter().all(|b| b.handle.is_finished())
    }

    /// Current state of every branch, in declaration order
    pub fn branch_states(&self) -> Vec<(String, BranchState)> {
        self.branches
            .iter()
            .map(|b| (b.name.clone(), *b.state.lock()))
            .collect()
    }

    pub fn counters(&self) -> &TopologyCounters {
        &self.counters
    }

    /// Block until every stage and branch reached a terminal state.
    ///
    /// The outcome is decided by how the stages ended, so cancelling a
    /// topology that already finished does not change it.
    pub fn wait(self) -> TopologyReport {
        let RunningTopology {
            name,
            cancel: _,
            registration,
            counters,
            tick_stats,
            failure_policy,
            stages,
            branches,
            started,
        } = self;

        let mut panicked = Vec::new();
        let mut exits = Vec::with_capacity(stages.len());
        for (stage, handle) in stages {
            match handle.join() {
                Ok(exit) => exits.push((stage, exit)),
                Err(_) => {
                    warn!(topology = %name, stage, "stage panicked");
                    panicked.push(stage.to_string());
                }
            }
        }

        let mut reports = Vec::with_capacity(branches.len());
        for branch in branches {
            match branch.handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => {
                    warn!(topology = %name, branch = %branch.name, "consumer panicked");
                    *branch.state.lock() = BranchState::Failed;
                    reports.push(BranchReport {
                        error: Some(PipelineError::StagePanic(branch.name.clone()).to_string()),
                        name: branch.name.clone(),
                        state: BranchState::Failed,
                        received: 0,
                        processed: 0,
                        buffer: None,
                    });
                    panicked.push(branch.name);
                }
            }
        }

        // Every thread is joined; the executor no longer needs to reach us.
        drop(registration);

        let outcome = classify(failure_policy, &panicked, &exits, &reports);
        let report = TopologyReport {
            name,
            outcome,
            produced: counters.produced(),
            emitted: counters.emitted(),
            forwarded: counters.forwarded(),
            ticks_fired: tick_stats.as_ref().map_or(0, |s| s.fired()),
            ticks_expired: tick_stats.as_ref().map_or(0, |s| s.expired()),
            elapsed: started.elapsed(),
            branches: reports,
        };
        info!(
            topology = %report.name,
            outcome = %report.outcome,
            elapsed = ?report.elapsed,
            "topology finished"
        );
        report
    }

    /// Wait up to `timeout`, then cancel and wait for the unwinding
    pub fn wait_timeout(self, timeout: Duration) -> TopologyReport {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !self.is_finished() {
            debug!(topology = %self.name, ?timeout, "timed out, cancelling");
            self.cancel();
        }
        self.wait()
    }
}

fn classify(
    failure_policy: FailurePolicy,
    panicked: &[String],
    exits: &[(&'static str, StageExit)],
    branches: &[BranchReport],
) -> TopologyOutcome {
    if let Some(stage) = panicked.first() {
        return TopologyOutcome::Failed(PipelineError::StagePanic(stage.clone()).to_string());
    }

    if let Some((_, StageExit::Failed(message))) =
        exits.iter().find(|(_, e)| matches!(e, StageExit::Failed(_)))
    {
        return TopologyOutcome::Failed(message.clone());
    }

    if failure_policy == FailurePolicy::CancelTopology {
        if let Some(failed) = branches.iter().find(|b| b.state == BranchState::Failed) {
            return TopologyOutcome::Failed(format!(
                "branch '{}' failed: {}",
                failed.name,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    let stage_cancelled = exits.iter().any(|(_, e)| *e == StageExit::Cancelled);
    if stage_cancelled || branches.iter().any(|b| b.state == BranchState::Cancelled) {
        return TopologyOutcome::Cancelled;
    }

    if branches.iter().all(|b| b.state == BranchState::Failed) {
        return TopologyOutcome::Failed("every branch failed".into());
    }
    TopologyOutcome::Completed
}

/// How a topology ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyOutcome {
    /// The producer completed and at least one branch consumed everything
    Completed,
    /// Stopped on request
    Cancelled,
    /// Unrecovered failure: production failure, stage panic, a consumer
    /// failure under [`FailurePolicy::CancelTopology`], or every branch failed
    Failed(String),
}

impl fmt::Display for TopologyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyOutcome::Completed => write!(f, "completed"),
            TopologyOutcome::Cancelled => write!(f, "cancelled"),
            TopologyOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Final account of one topology
#[derive(Debug, Clone)]
pub struct TopologyReport {
    pub name: String,
    pub outcome: TopologyOutcome,
    pub produced: u64,
    pub emitted: u64,
    pub forwarded: u64,
    pub ticks_fired: u64,
    pub ticks_expired: u64,
    pub elapsed: Duration,
    pub branches: Vec<BranchReport>,
}

impl TopologyReport {
    pub fn branch(&self, name: &str) -> Option<&BranchReport> {
        self.branches.iter().find(|b| b.name == name)
    }

    /// Whether this topology ended in an unrecovered failure
    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, TopologyOutcome::Failed(_))
    }

    pub fn format(&self) -> String {
        let mut out = format!(
            "{}: {} in {:.2?} (produced={}, emitted={}, forwarded={}, ticks={}/{} expired)\n",
            self.name,
            self.outcome,
            self.elapsed,
            self.produced,
            self.emitted,
            self.forwarded,
            self.ticks_fired,
            self.ticks_expired,
        );
        for branch in &self.branches {
            out.push_str(&format!(
                "  {}: {:?}, received={}, processed={}",
                branch.name, branch.state, branch.received, branch.processed
            ));
            if let Some(buffer) = &branch.buffer {
                out.push_str(&format!(
                    ", buffer {:?} {}/{} (high water {}, dropped {})",
                    buffer.policy, buffer.len, buffer.capacity, buffer.high_water, buffer.dropped
                ));
            }
            if let Some(error) = &branch.error {
                out.push_str(&format!(", error: {}", error));
            }
            out.push('\n');
        }
        out
    }
}
