use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::buffer::{BufferReader, BufferStats};
use crate::delay::DelayModel;
use crate::error::{ConsumerError, Result};
use crate::link::{Inlet, Signal};
use crate::stage::StageContext;

/// Processing step at the end of a branch
pub trait Consumer<T>: Send + 'static {
    /// Handle one item
    fn process(&mut self, item: T) -> std::result::Result<(), ConsumerError>;

    /// Called before the first request
    fn on_start(&mut self) {}

    /// Called once the upstream completed and every item was processed
    fn on_complete(&mut self) {}
}

/// A consumer that applies a closure to each item
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F> {
    pub fn new<T>(f: F) -> Self
    where
        F: FnMut(T) -> std::result::Result<(), ConsumerError> + Send + 'static,
    {
        Self { f }
    }
}

impl<T, F> Consumer<T> for FnConsumer<F>
where
    F: FnMut(T) -> std::result::Result<(), ConsumerError> + Send + 'static,
{
    fn process(&mut self, item: T) -> std::result::Result<(), ConsumerError> {
        (self.f)(item)
    }
}

/// Keeps every item it receives, shared with whoever holds [`Collector::items`]
#[derive(Debug)]
pub struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Collector<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn items(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Consumer<T> for Collector<T> {
    fn process(&mut self, item: T) -> std::result::Result<(), ConsumerError> {
        self.items.lock().push(item);
        Ok(())
    }
}

/// Where a branch's items come from
#[derive(Debug)]
pub enum BranchSource<T> {
    Direct(Inlet<T>),
    Buffered(BufferReader<T>),
}

impl<T> BranchSource<T> {
    /// Ask for exactly one item and wait for it
    fn next(&mut self) -> Result<Signal<T>> {
        match self {
            BranchSource::Direct(inlet) => inlet.pull(),
            BranchSource::Buffered(reader) => reader.pop(),
        }
    }

    fn buffer_stats(&self) -> Option<BufferStats> {
        match self {
            BranchSource::Direct(_) => None,
            BranchSource::Buffered(reader) => Some(reader.buffer().stats()),
        }
    }
}

/// Lifecycle of one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Not waiting for anything yet, or between items
    Idle,
    /// One unit of demand is outstanding
    Requesting,
    /// Working on exactly one item
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BranchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BranchState::Completed | BranchState::Failed | BranchState::Cancelled
        )
    }
}

/// What the topology does when one consumer fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Only the failing branch stops
    #[default]
    IsolateBranch,
    /// The whole topology is cancelled
    CancelTopology,
}

/// Final account of one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchReport {
    pub name: String,
    pub state: BranchState,
    /// Items taken from the source
    pub received: u64,
    /// Items the consumer handled successfully
    pub processed: u64,
    pub error: Option<String>,
    pub buffer: Option<BufferStats>,
}

/// Demand-driven sink: requests one item, processes it, requests the next.
pub struct ConsumerActor<T> {
    name: String,
    source: BranchSource<T>,
    consumer: Box<dyn Consumer<T>>,
    delay: DelayModel,
    failure_policy: FailurePolicy,
    state: Arc<Mutex<BranchState>>,
}

impl<T: Send + 'static> ConsumerActor<T> {
    pub fn new(
        name: impl Into<String>,
        source: BranchSource<T>,
        consumer: Box<dyn Consumer<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            consumer,
            delay: DelayModel::Zero,
            failure_policy: FailurePolicy::default(),
            state: Arc::new(Mutex::new(BranchState::Idle)),
        }
    }

    /// Simulated processing time per item
    pub fn with_delay(mut self, delay: DelayModel) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live view of the branch state
    pub fn state_handle(&self) -> Arc<Mutex<BranchState>> {
        Arc::clone(&self.state)
    }

    fn transition(&self, next: BranchState) {
        *self.state.lock() = next;
    }

    pub fn run(mut self, ctx: &StageContext) -> BranchReport {
        debug!(
            topology = %ctx.topology,
            branch = %self.name,
            delay = ?self.delay,
            "consumer started"
        );
        self.consumer.on_start();

        let mut received = 0u64;
        let mut processed = 0u64;
        let (state, error) = loop {
            self.transition(BranchState::Requesting);
            let signal = match self.source.next() {
                Ok(signal) => signal,
                Err(_) => break (BranchState::Cancelled, None),
            };

            let item = match signal {
                Signal::Item(item) => item,
                Signal::Complete => {
                    self.consumer.on_complete();
                    ctx.log(&format!(
                        "branch {} completed after {} items",
                        self.name, processed
                    ));
                    ctx.count(&format!("branch.{}.completed", self.name));
                    break (BranchState::Completed, None);
                }
                Signal::Failed(failure) => {
                    debug!(
                        topology = %ctx.topology,
                        branch = %self.name,
                        %failure,
                        "upstream failed"
                    );
                    break (BranchState::Failed, Some(failure.to_string()));
                }
            };

            received += 1;
            self.transition(BranchState::Processing);
            let started = Instant::now();
            if ctx.cancel.sleep(self.delay.delay_for(received - 1)).is_err() {
                break (BranchState::Cancelled, None);
            }

            match self.consumer.process(item) {
                Ok(()) => {
                    processed += 1;
                    ctx.count(&format!("branch.{}.processed", self.name));
                    ctx.time(&format!("branch.{}.latency", self.name), started.elapsed());
                    self.transition(BranchState::Idle);
                }
                Err(e) => {
                    warn!(
                        topology = %ctx.topology,
                        branch = %self.name,
                        error = %e,
                        "consumer failed"
                    );
                    ctx.count(&format!("branch.{}.failed", self.name));
                    ctx.log(&format!("branch {} failed: {}", self.name, e));
                    if self.failure_policy == FailurePolicy::CancelTopology {
                        ctx.cancel.cancel();
                    }
                    break (BranchState::Failed, Some(e.to_string()));
                }
            }
        };

        self.transition(state);
        debug!(topology = %ctx.topology, branch = %self.name, ?state, received, "consumer stopped");
        BranchReport {
            buffer: self.source.buffer_stats(),
            name: self.name,
            state,
            received,
            processed,
            error,
        }
    }
}

impl<T> fmt::Debug for ConsumerActor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerActor")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BoundedBranchBuffer, OverflowPolicy};
    use crate::cancel::CancelToken;
    use crate::error::StreamFailure;
    use crate::link::{link, Demand};
    use crate::metrics::MetricsRecorder;
    use std::thread;
    use std::time::Duration;

    fn context() -> (StageContext, Arc<MetricsRecorder>) {
        let recorder = Arc::new(MetricsRecorder::new());
        let ctx = StageContext::new("c", CancelToken::new(), recorder.clone());
        (ctx, recorder)
    }

    #[test]
    fn test_one_request_at_a_time() {
        let (ctx, _recorder) = context();
        let (mut outlet, inlet) = link(&ctx.cancel);
        let collector = Collector::<u32>::new();
        let items = collector.items();
        let actor = ConsumerActor::new("one", BranchSource::Direct(inlet), Box::new(collector))
            .with_delay(DelayModel::constant_ms(5));

        let actor_ctx = ctx.clone();
        let handle = thread::spawn(move || actor.run(&actor_ctx));

        for i in 0..5u32 {
            assert_eq!(outlet.await_demand().unwrap(), Demand::Ready);
            // A second token never arrives while the first is unanswered.
            assert_eq!(outlet.tokens(), 1);
            outlet.push(i).unwrap();
        }
        outlet.complete().unwrap();

        let outcome = handle.join().unwrap();
        assert_eq!(outcome.state, BranchState::Completed);
        assert_eq!(outcome.received, 5);
        assert_eq!(outcome.processed, 5);
        assert_eq!(*items.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_consumer_failure_isolated() {
        let (ctx, recorder) = context();
        let (mut outlet, inlet) = link(&ctx.cancel);
        let consumer = FnConsumer::new(|item: u32| {
            if item == 2 {
                Err(ConsumerError::new("bad item"))
            } else {
                Ok(())
            }
        });
        let actor = ConsumerActor::new("picky", BranchSource::Direct(inlet), Box::new(consumer));
        let state = actor.state_handle();

        let actor_ctx = ctx.clone();
        let handle = thread::spawn(move || actor.run(&actor_ctx));
        for i in 0..3u32 {
            outlet.push(i).unwrap();
        }

        let outcome = handle.join().unwrap();
        assert_eq!(outcome.state, BranchState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("bad item"));
        assert_eq!(outcome.processed, 2);
        assert_eq!(*state.lock(), BranchState::Failed);
        assert!(!ctx.cancel.is_cancelled());
        assert_eq!(recorder.counter("c.branch.picky.failed"), 1);
        assert_eq!(outlet.await_demand().unwrap(), Demand::Detached);
    }

    #[test]
    fn test_consumer_failure_cancels_topology() {
        let (ctx, _recorder) = context();
        let (mut outlet, inlet) = link(&ctx.cancel);
        let consumer = FnConsumer::new(|_: u32| Err(ConsumerError::new("always")));
        let actor = ConsumerActor::new("strict", BranchSource::Direct(inlet), Box::new(consumer))
            .with_failure_policy(FailurePolicy::CancelTopology);

        let actor_ctx = ctx.clone();
        let handle = thread::spawn(move || actor.run(&actor_ctx));
        outlet.push(1).unwrap();

        assert_eq!(handle.join().unwrap().state, BranchState::Failed);
        assert!(ctx.cancel.is_cancelled());
    }

    #[test]
    fn test_upstream_failure_terminates_branch() {
        let (ctx, _recorder) = context();
        let (outlet, inlet) = link::<u32>(&ctx.cancel);
        let actor = ConsumerActor::new(
            "b",
            BranchSource::Direct(inlet),
            Box::new(Collector::<u32>::new()),
        );
        outlet.fail(StreamFailure::UpstreamLost).unwrap();

        let outcome = actor.run(&ctx);
        assert_eq!(outcome.state, BranchState::Failed);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_buffered_source_reports_stats() {
        let (ctx, _recorder) = context();
        let (mut writer, reader) =
            BoundedBranchBuffer::channel(2, OverflowPolicy::DropOldest, &ctx.cancel).unwrap();
        for i in 0..5u32 {
            writer.offer(i).unwrap();
        }
        writer.complete();

        let collector = Collector::<u32>::new();
        let items = collector.items();
        let outcome = ConsumerActor::new("buf", BranchSource::Buffered(reader), Box::new(collector))
            .run(&ctx);

        assert_eq!(outcome.state, BranchState::Completed);
        assert_eq!(*items.lock(), vec![3, 4]);
        let stats = outcome.buffer.unwrap();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.high_water, 2);
    }

    #[test]
    fn test_cancel_during_processing() {
        let (ctx, _recorder) = context();
        let (mut outlet, inlet) = link(&ctx.cancel);
        let actor = ConsumerActor::new(
            "slow",
            BranchSource::Direct(inlet),
            Box::new(Collector::<u32>::new()),
        )
        .with_delay(DelayModel::constant_ms(10_000));
        let state = actor.state_handle();

        let actor_ctx = ctx.clone();
        let handle = thread::spawn(move || actor.run(&actor_ctx));
        outlet.push(1u32).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(*state.lock(), BranchState::Processing);

        ctx.cancel.cancel();
        let outcome = handle.join().unwrap();
        assert_eq!(outcome.state, BranchState::Cancelled);
        assert_eq!(outcome.processed, 0);
        assert!(state.lock().is_terminal());
    }
}
