use std::fmt;
use tracing::{debug, warn};

use crate::delay::DelayModel;
use crate::error::{ProductionError, StreamFailure};
use crate::link::{Demand, Outlet};
use crate::stage::{forwarded, StageContext, StageExit};

/// Ordered, possibly infinite, fallible item sequence
pub type ItemSource<T> = Box<dyn Iterator<Item = Result<T, ProductionError>> + Send>;

/// Head of a topology: yields items in sequence order, one per unit of
/// demand from the rate limiter
pub struct Producer<T> {
    source: ItemSource<T>,
    delay: DelayModel,
}

impl<T: Send + 'static> Producer<T> {
    /// Produce every value of an infallible sequence
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::fallible(items.into_iter().map(Ok))
    }

    /// Produce a fallible sequence; the first `Err` fails the stream
    pub fn fallible<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<T, ProductionError>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Box::new(items.into_iter()),
            delay: DelayModel::Zero,
        }
    }

    /// Simulated time spent producing each item
    pub fn with_delay(mut self, delay: DelayModel) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn run(self, mut outlet: Outlet<T>, ctx: &StageContext) -> StageExit {
        let Producer { source, delay } = self;
        debug!(topology = %ctx.topology, ?delay, "producer started");

        for (index, next) in (0u64..).zip(source) {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    warn!(topology = %ctx.topology, error = %e, "generator failed");
                    ctx.count("producer.failed");
                    ctx.log(&format!("production failed after {} items: {}", index, e));
                    let message = e.to_string();
                    return forwarded(
                        outlet.fail(StreamFailure::Production(e)),
                        StageExit::Failed(message),
                    );
                }
            };

            let pause = delay.delay_for(index);
            if ctx.cancel.sleep(pause).is_err() {
                return StageExit::Cancelled;
            }

            match outlet.push(item) {
                Ok(Demand::Ready) => {
                    ctx.counters.add_produced();
                    ctx.count("producer.produced");
                    ctx.time("producer.delay", pause);
                }
                Ok(Demand::Detached) => {
                    debug!(topology = %ctx.topology, "producer detached");
                    return StageExit::Detached;
                }
                Err(_) => return StageExit::Cancelled,
            }
        }

        debug!(topology = %ctx.topology, produced = ctx.counters.produced(), "producer exhausted");
        forwarded(outlet.complete(), StageExit::Completed)
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
