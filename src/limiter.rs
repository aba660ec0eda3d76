//! Admission control: zips the item stream with the tick stream.

use std::time::Instant;
use tracing::{debug, trace};

use crate::error::StreamFailure;
use crate::link::{Demand, Inlet, Outlet, Signal};
use crate::stage::{forwarded, StageContext, StageExit};
use crate::tick::Ticks;

/// Releases one item per tick, and only when downstream asked for one.
///
/// Per emission: wait for downstream demand, pull one item from the
/// producer, wait for one tick, hand the item on. Completion and failure of
/// the item stream pass through without waiting for a tick.
pub struct RateLimiter<T> {
    items: Inlet<T>,
    ticks: Ticks,
    outlet: Outlet<T>,
}

impl<T: Send> RateLimiter<T> {
    pub fn new(items: Inlet<T>, ticks: Ticks, outlet: Outlet<T>) -> Self {
        Self {
            items,
            ticks,
            outlet,
        }
    }

    pub fn run(self, ctx: &StageContext) -> StageExit {
        let RateLimiter {
            mut items,
            ticks,
            mut outlet,
        } = self;
        debug!(topology = %ctx.topology, "rate limiter started");

        let exit = loop {
            match outlet.await_demand() {
                Ok(Demand::Ready) => {}
                Ok(Demand::Detached) => break StageExit::Detached,
                Err(_) => break StageExit::Cancelled,
            }

            let item = match items.pull() {
                Ok(Signal::Item(item)) => item,
                Ok(Signal::Complete) => break forwarded(outlet.complete(), StageExit::Completed),
                Ok(Signal::Failed(failure)) => {
                    let message = failure.to_string();
                    break forwarded(outlet.fail(failure), StageExit::Failed(message));
                }
                Err(_) => break StageExit::Cancelled,
            };

            let waiting = Instant::now();
            let tick = match ticks.next(&ctx.cancel) {
                Ok(Some(tick)) => tick,
                Ok(None) => {
                    break forwarded(
                        outlet.fail(StreamFailure::UpstreamLost),
                        StageExit::Failed("tick source closed".into()),
                    )
                }
                Err(_) => break StageExit::Cancelled,
            };
            ctx.time("limiter.tick_wait", waiting.elapsed());
            trace!(topology = %ctx.topology, seq = tick.seq, "tick paired");

            match outlet.push(item) {
                Ok(Demand::Ready) => {
                    ctx.counters.add_emitted();
                    ctx.count("limiter.emitted");
                }
                Ok(Demand::Detached) => break StageExit::Detached,
                Err(_) => break StageExit::Cancelled,
            }
        };

        ticks.stop();
        debug!(
            topology = %ctx.topology,
            emitted = ctx.counters.emitted(),
            ?exit,
            "rate limiter stopped"
        );
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::link::link;
    use crate::observe::NoopObserver;
    use crate::producer::Producer;
    use crate::tick::Tick;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tick(seq: u64) -> Tick {
        Tick {
            seq,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_one_item_per_tick() {
        let ctx = StageContext::new("rl", CancelToken::new(), Arc::new(NoopObserver));
        let (producer_out, limiter_in) = link(&ctx.cancel);
        let (limiter_out, mut sink) = link(&ctx.cancel);
        let (tick_tx, ticks) = Ticks::manual();

        let producer_ctx = ctx.clone();
        let producer =
            thread::spawn(move || Producer::new(0u32..100).run(producer_out, &producer_ctx));
        let limiter_ctx = ctx.clone();
        let limiter = thread::spawn(move || {
            RateLimiter::new(limiter_in, ticks, limiter_out).run(&limiter_ctx)
        });

        for seq in 0..3 {
            tick_tx.send(tick(seq)).unwrap();
            assert_eq!(sink.pull().unwrap(), Signal::Item(seq as u32));
        }

        // Demand is outstanding and items are ready, but no tick: nothing moves.
        sink.request().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.counters.emitted(), 3);

        tick_tx.send(tick(3)).unwrap();
        assert_eq!(sink.pull().unwrap(), Signal::Item(3));

        ctx.cancel.cancel();
        assert_eq!(limiter.join().unwrap(), StageExit::Cancelled);
        assert_eq!(producer.join().unwrap(), StageExit::Cancelled);
    }

    #[test]
    fn test_completion_needs_no_tick() {
        let ctx = StageContext::new("rl", CancelToken::new(), Arc::new(NoopObserver));
        let (producer_out, limiter_in) = link(&ctx.cancel);
        let (limiter_out, mut sink) = link(&ctx.cancel);
        let (_tick_tx, ticks) = Ticks::manual();

        let producer_ctx = ctx.clone();
        let producer = thread::spawn(move || {
            Producer::new(Vec::<u32>::new()).run(producer_out, &producer_ctx)
        });
        let limiter_ctx = ctx.clone();
        let limiter = thread::spawn(move || {
            RateLimiter::new(limiter_in, ticks, limiter_out).run(&limiter_ctx)
        });

        assert_eq!(sink.pull().unwrap(), Signal::Complete);
        assert_eq!(limiter.join().unwrap(), StageExit::Completed);
        assert_eq!(producer.join().unwrap(), StageExit::Completed);
    }

    #[test]
    fn test_closed_tick_source_fails_downstream() {
        let ctx = StageContext::new("rl", CancelToken::new(), Arc::new(NoopObserver));
        let (producer_out, limiter_in) = link(&ctx.cancel);
        let (limiter_out, mut sink) = link(&ctx.cancel);
        let (tick_tx, ticks) = Ticks::manual();
        drop(tick_tx);

        let producer_ctx = ctx.clone();
        let producer =
            thread::spawn(move || Producer::new(0u32..).run(producer_out, &producer_ctx));
        let limiter_ctx = ctx.clone();
        let limiter = thread::spawn(move || {
            RateLimiter::new(limiter_in, ticks, limiter_out).run(&limiter_ctx)
        });

        assert_eq!(
            sink.pull().unwrap(),
            Signal::Failed(StreamFailure::UpstreamLost)
        );
        assert!(matches!(limiter.join().unwrap(), StageExit::Failed(_)));
        assert_eq!(producer.join().unwrap(), StageExit::Detached);
    }
}
