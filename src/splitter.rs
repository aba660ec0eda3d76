//! Fan-out of one stream to a fixed set of branches.

use tracing::{debug, info};

use crate::buffer::{BufferWriter, Offer};
use crate::error::{PipelineError, Result, StreamFailure};
use crate::link::{Demand, Inlet, Outlet, Signal};
use crate::stage::{StageContext, StageExit};

/// How the splitter reaches one branch
#[derive(Debug)]
pub enum BranchPort<T> {
    /// Straight to the consumer; gates the splitter on the consumer's demand
    Direct(Outlet<T>),
    /// Through a bounded buffer; gates only if the policy says so
    Buffered(BufferWriter<T>),
}

impl<T> BranchPort<T> {
    /// Wait until this branch can take the next item without stalling
    fn ready(&mut self) -> Result<Demand> {
        match self {
            BranchPort::Direct(outlet) => outlet.await_demand(),
            BranchPort::Buffered(writer) => writer.wait_for_slot(),
        }
    }

    fn deliver(&mut self, item: T) -> Result<Offer> {
        match self {
            BranchPort::Direct(outlet) => match outlet.push(item)? {
                Demand::Ready => Ok(Offer::Accepted),
                Demand::Detached => Ok(Offer::Detached),
            },
            BranchPort::Buffered(writer) => writer.offer(item),
        }
    }

    fn complete(self) -> Result<()> {
        match self {
            BranchPort::Direct(outlet) => outlet.complete(),
            BranchPort::Buffered(writer) => {
                writer.complete();
                Ok(())
            }
        }
    }

    fn fail(self, failure: StreamFailure) -> Result<()> {
        match self {
            BranchPort::Direct(outlet) => outlet.fail(failure),
            BranchPort::Buffered(writer) => {
                writer.fail(failure);
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Branch<T> {
    name: String,
    port: BranchPort<T>,
    live: bool,
}

/// Replicates every input item to all live branches.
///
/// The next item is pulled only once every live gating branch is ready for
/// it, so the splitter never runs ahead of its slowest unbuffered (or
/// block-buffered) branch. A branch whose consumer is gone is detached and
/// the others carry on.
#[derive(Debug)]
pub struct BroadcastSplitter<T> {
    input: Inlet<T>,
    branches: Vec<Branch<T>>,
}

impl<T: Clone + Send> BroadcastSplitter<T> {
    pub fn new(input: Inlet<T>) -> Self {
        Self {
            input,
            branches: Vec::new(),
        }
    }

    pub fn add_branch(&mut self, name: impl Into<String>, port: BranchPort<T>) {
        self.branches.push(Branch {
            name: name.into(),
            port,
            live: true,
        });
    }

    /// Fan-out degree
    pub fn degree(&self) -> usize {
        self.branches.len()
    }

    pub fn run(self, ctx: &StageContext) -> StageExit {
        let BroadcastSplitter {
            mut input,
            mut branches,
        } = self;
        debug!(topology = %ctx.topology, degree = branches.len(), "splitter started");

        loop {
            if await_branches(&mut branches, ctx).is_err() {
                return StageExit::Cancelled;
            }
            if branches.iter().all(|b| !b.live) {
                info!(topology = %ctx.topology, "all branches detached, splitter stopping");
                return StageExit::Detached;
            }

            match input.pull() {
                Ok(Signal::Item(item)) => {
                    if deliver(&mut branches, item, ctx).is_err() {
                        return StageExit::Cancelled;
                    }
                    ctx.counters.add_forwarded();
                    ctx.count("splitter.forwarded");
                }
                Ok(Signal::Complete) => {
                    debug!(topology = %ctx.topology, "input completed, completing branches");
                    let sent = branches.into_iter().map(|b| b.port.complete()).collect();
                    return terminal(sent, StageExit::Completed);
                }
                Ok(Signal::Failed(failure)) => {
                    debug!(topology = %ctx.topology, %failure, "input failed, failing branches");
                    let message = failure.to_string();
                    let sent = branches
                        .into_iter()
                        .map(|b| b.port.fail(failure.clone()))
                        .collect();
                    return terminal(sent, StageExit::Failed(message));
                }
                Err(_) => return StageExit::Cancelled,
            }
        }
    }
}

fn await_branches<T>(branches: &mut [Branch<T>], ctx: &StageContext) -> Result<()> {
    for branch in branches.iter_mut().filter(|b| b.live) {
        if branch.port.ready()? == Demand::Detached {
            detach(branch, ctx);
        }
    }
    Ok(())
}

fn deliver<T: Clone>(branches: &mut [Branch<T>], item: T, ctx: &StageContext) -> Result<()> {
    for branch in branches.iter_mut().filter(|b| b.live) {
        match branch.port.deliver(item.clone())? {
            Offer::Accepted => {}
            Offer::DroppedOldest | Offer::DroppedNewest => {
                ctx.count(&format!("branch.{}.dropped", branch.name));
            }
            Offer::Detached => detach(branch, ctx),
        }
    }
    Ok(())
}

fn detach<T>(branch: &mut Branch<T>, ctx: &StageContext) {
    branch.live = false;
    debug!(topology = %ctx.topology, branch = %branch.name, "branch detached");
    ctx.count(&format!("branch.{}.detached", branch.name));
}

fn terminal(sent: Vec<Result<()>>, exit: StageExit) -> StageExit {
    if sent
        .iter()
        .any(|r| matches!(r, Err(PipelineError::Cancelled)))
    {
        StageExit::Cancelled
    } else {
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BoundedBranchBuffer, OverflowPolicy};
    use crate::cancel::CancelToken;
    use crate::link::link;
    use crate::metrics::MetricsRecorder;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn context() -> (StageContext, Arc<MetricsRecorder>) {
        let recorder = Arc::new(MetricsRecorder::new());
        let ctx = StageContext::new("s", CancelToken::new(), recorder.clone());
        (ctx, recorder)
    }

    /// Feeds `items` then completion into the splitter's input
    fn feed(ctx: &StageContext, items: Vec<u32>) -> (Inlet<u32>, thread::JoinHandle<()>) {
        let (mut outlet, inlet) = link(&ctx.cancel);
        let handle = thread::spawn(move || {
            for item in items {
                if outlet.push(item).is_err() {
                    return;
                }
            }
            let _ = outlet.complete();
        });
        (inlet, handle)
    }

    fn collect(mut inlet: Inlet<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(Signal::Item(item)) = inlet.pull() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_replicates_to_every_branch() {
        let (ctx, _recorder) = context();
        let (input, feeder) = feed(&ctx, (0..20).collect());
        let mut splitter = BroadcastSplitter::new(input);

        let mut sinks = Vec::new();
        for name in ["a", "b", "c"] {
            let (outlet, inlet) = link(&ctx.cancel);
            splitter.add_branch(name, BranchPort::Direct(outlet));
            sinks.push(thread::spawn(move || collect(inlet)));
        }
        assert_eq!(splitter.degree(), 3);

        assert_eq!(splitter.run(&ctx), StageExit::Completed);
        for sink in sinks {
            assert_eq!(sink.join().unwrap(), (0..20).collect::<Vec<_>>());
        }
        feeder.join().unwrap();
    }

    #[test]
    fn test_unbuffered_branch_gates_pull() {
        let (ctx, _recorder) = context();
        let (input, _feeder) = feed(&ctx, (0..100).collect());
        let mut splitter = BroadcastSplitter::new(input);

        let (fast_out, fast_in) = link(&ctx.cancel);
        let (slow_out, mut slow_in) = link::<u32>(&ctx.cancel);
        splitter.add_branch("fast", BranchPort::Direct(fast_out));
        splitter.add_branch("slow", BranchPort::Direct(slow_out));

        let splitter_ctx = ctx.clone();
        let handle = thread::spawn(move || splitter.run(&splitter_ctx));
        let fast = thread::spawn(move || collect(fast_in));

        // The slow branch takes two items and then stops asking.
        assert_eq!(slow_in.pull().unwrap(), Signal::Item(0));
        assert_eq!(slow_in.pull().unwrap(), Signal::Item(1));
        thread::sleep(Duration::from_millis(50));
        assert!(ctx.counters.forwarded() <= 3);

        ctx.cancel.cancel();
        assert_eq!(handle.join().unwrap(), StageExit::Cancelled);
        assert!(fast.join().unwrap().len() <= 3);
    }

    #[test]
    fn test_drop_buffer_does_not_gate() {
        let (ctx, recorder) = context();
        let (input, feeder) = feed(&ctx, (0..50).collect());
        let mut splitter = BroadcastSplitter::new(input);

        let (fast_out, fast_in) = link(&ctx.cancel);
        let (writer, mut reader) =
            BoundedBranchBuffer::channel(2, OverflowPolicy::DropNewest, &ctx.cancel).unwrap();
        let buffer = writer.buffer().clone();
        splitter.add_branch("fast", BranchPort::Direct(fast_out));
        splitter.add_branch("stalled", BranchPort::Buffered(writer));

        let fast = thread::spawn(move || collect(fast_in));

        // Nobody reads the buffered branch until the run is over.
        assert_eq!(splitter.run(&ctx), StageExit::Completed);
        assert_eq!(fast.join().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(buffer.dropped_count(), 48);
        assert_eq!(recorder.counter("s.branch.stalled.dropped"), 48);

        assert_eq!(reader.pop().unwrap(), Signal::Item(0));
        assert_eq!(reader.pop().unwrap(), Signal::Item(1));
        assert_eq!(reader.pop().unwrap(), Signal::Complete);
        feeder.join().unwrap();
    }

    #[test]
    fn test_detached_branch_does_not_stall_others() {
        let (ctx, recorder) = context();
        let (input, feeder) = feed(&ctx, (0..10).collect());
        let mut splitter = BroadcastSplitter::new(input);

        let (keep_out, keep_in) = link(&ctx.cancel);
        let (gone_out, gone_in) = link::<u32>(&ctx.cancel);
        splitter.add_branch("keep", BranchPort::Direct(keep_out));
        splitter.add_branch("gone", BranchPort::Direct(gone_out));
        drop(gone_in);

        let keep = thread::spawn(move || collect(keep_in));
        assert_eq!(splitter.run(&ctx), StageExit::Completed);
        assert_eq!(keep.join().unwrap().len(), 10);
        assert_eq!(recorder.counter("s.branch.gone.detached"), 1);
        feeder.join().unwrap();
    }

    #[test]
    fn test_all_detached_stops_splitter() {
        let (ctx, _recorder) = context();
        let (input, feeder) = feed(&ctx, (0..10).collect());
        let mut splitter = BroadcastSplitter::new(input);
        let (out, inlet) = link::<u32>(&ctx.cancel);
        splitter.add_branch("only", BranchPort::Direct(out));
        drop(inlet);

        assert_eq!(splitter.run(&ctx), StageExit::Detached);
        feeder.join().unwrap();
    }

    #[test]
    fn test_failure_reaches_all_branches() {
        let (ctx, _recorder) = context();
        let (outlet, input) = link::<u32>(&ctx.cancel);
        let mut splitter = BroadcastSplitter::new(input);

        let (direct_out, mut direct_in) = link(&ctx.cancel);
        let (writer, mut reader) =
            BoundedBranchBuffer::channel(4, OverflowPolicy::Block, &ctx.cancel).unwrap();
        splitter.add_branch("direct", BranchPort::Direct(direct_out));
        splitter.add_branch("buffered", BranchPort::Buffered(writer));

        let splitter_ctx = ctx.clone();
        let handle = thread::spawn(move || splitter.run(&splitter_ctx));
        let direct = thread::spawn(move || direct_in.pull().unwrap());

        outlet.fail(StreamFailure::UpstreamLost).unwrap();
        assert_eq!(
            direct.join().unwrap(),
            Signal::Failed(StreamFailure::UpstreamLost)
        );
        assert_eq!(
            reader.pop().unwrap(),
            Signal::Failed(StreamFailure::UpstreamLost)
        );
        assert!(matches!(handle.join().unwrap(), StageExit::Failed(_)));
    }
}
