//! Demand-driven point-to-point links between stages.
//!
//! A link is a pair of bounded(1) channels: items and terminal signals travel
//! downstream from an [`Outlet`] to an [`Inlet`], and [`DemandToken`]s travel
//! upstream. An outlet may hand over an item only while it holds a token, and
//! an inlet never has more than one token outstanding.

use crossbeam::channel::{bounded, select, Receiver, Sender};

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result, StreamFailure};

/// One unit of downstream readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandToken;

/// What travels downstream over a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    Item(T),
    Complete,
    Failed(StreamFailure),
}

/// Outcome of waiting for demand on an outlet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// At least one token is held
    Ready,
    /// The downstream side went away and will never request again
    Detached,
}

/// Create a linked outlet/inlet pair observing `cancel`
pub fn link<T>(cancel: &CancelToken) -> (Outlet<T>, Inlet<T>) {
    let (demand_tx, demand_rx) = bounded(1);
    let (signal_tx, signal_rx) = bounded(1);

    let outlet = Outlet {
        demand: demand_rx,
        signals: signal_tx,
        tokens: 0,
        cancel: cancel.clone(),
    };
    let inlet = Inlet {
        demand: demand_tx,
        signals: signal_rx,
        outstanding: false,
        cancel: cancel.clone(),
    };
    (outlet, inlet)
}

/// Upstream end of a link
#[derive(Debug)]
pub struct Outlet<T> {
    demand: Receiver<DemandToken>,
    signals: Sender<Signal<T>>,
    tokens: usize,
    cancel: CancelToken,
}

impl<T> Outlet<T> {
    /// Number of demand tokens currently held
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Block until a demand token is held or the downstream detaches
    pub fn await_demand(&mut self) -> Result<Demand> {
        if self.tokens > 0 {
            return Ok(Demand::Ready);
        }
        select! {
            recv(self.demand) -> token => match token {
                Ok(DemandToken) => {
                    self.tokens += 1;
                    Ok(Demand::Ready)
                }
                Err(_) => detached(&self.cancel),
            },
            recv(self.cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }

    /// Hand one item downstream, spending one demand token
    pub fn push(&mut self, item: T) -> Result<Demand> {
        if self.await_demand()? == Demand::Detached {
            return Ok(Demand::Detached);
        }
        self.tokens -= 1;
        self.send(Signal::Item(item))
    }

    /// Signal completion. Needs no demand.
    pub fn complete(mut self) -> Result<()> {
        self.send(Signal::Complete).map(|_| ())
    }

    /// Signal a stream failure. Needs no demand.
    pub fn fail(mut self, failure: StreamFailure) -> Result<()> {
        self.send(Signal::Failed(failure)).map(|_| ())
    }

    fn send(&mut self, signal: Signal<T>) -> Result<Demand> {
        select! {
            send(self.signals, signal) -> sent => match sent {
                Ok(()) => Ok(Demand::Ready),
                Err(_) => detached(&self.cancel),
            },
            recv(self.cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }
}

/// Downstream end of a link
#[derive(Debug)]
pub struct Inlet<T> {
    demand: Sender<DemandToken>,
    signals: Receiver<Signal<T>>,
    outstanding: bool,
    cancel: CancelToken,
}

impl<T> Inlet<T> {
    /// Whether a demand token has been sent and not yet answered
    pub fn has_outstanding_demand(&self) -> bool {
        self.outstanding
    }

    /// Send one demand token upstream unless one is already outstanding
    pub fn request(&mut self) -> Result<()> {
        if self.outstanding {
            return Ok(());
        }
        select! {
            send(self.demand, DemandToken) -> sent => {
                // A gone upstream is reported by the following receive.
                self.outstanding = sent.is_ok();
                Ok(())
            },
            recv(self.cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }

    /// Request one item and wait for it (or for a terminal signal)
    pub fn pull(&mut self) -> Result<Signal<T>> {
        self.request()?;
        select! {
            recv(self.signals) -> signal => {
                self.outstanding = false;
                match signal {
                    Ok(signal) => Ok(signal),
                    Err(_) => upstream_lost(&self.cancel),
                }
            },
            recv(self.cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }
}

/// Classify a downstream that vanished; during cancellation stages drop
/// their ends in any order
fn detached(cancel: &CancelToken) -> Result<Demand> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(Demand::Detached)
    }
}

/// Classify an upstream that vanished without a terminal signal
pub(crate) fn upstream_lost<T>(cancel: &CancelToken) -> Result<Signal<T>> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(Signal::Failed(StreamFailure::UpstreamLost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_waits_for_demand() {
        let cancel = CancelToken::new();
        let (mut outlet, mut inlet) = link::<u32>(&cancel);
        let sent = Arc::new(AtomicUsize::new(0));

        let sent_clone = Arc::clone(&sent);
        let producer = thread::spawn(move || {
            for i in 0..3 {
                outlet.push(i).unwrap();
                sent_clone.fetch_add(1, Ordering::SeqCst);
            }
            outlet.complete().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        assert_eq!(inlet.pull().unwrap(), Signal::Item(0));
        thread::sleep(Duration::from_millis(20));
        assert!(sent.load(Ordering::SeqCst) <= 1);

        assert_eq!(inlet.pull().unwrap(), Signal::Item(1));
        assert_eq!(inlet.pull().unwrap(), Signal::Item(2));
        assert_eq!(inlet.pull().unwrap(), Signal::Complete);
        producer.join().unwrap();
    }

    #[test]
    fn test_single_outstanding_demand() {
        let cancel = CancelToken::new();
        let (mut outlet, mut inlet) = link::<u32>(&cancel);

        inlet.request().unwrap();
        inlet.request().unwrap();
        assert!(inlet.has_outstanding_demand());

        assert_eq!(outlet.await_demand().unwrap(), Demand::Ready);
        assert_eq!(outlet.tokens(), 1);
        outlet.push(7).unwrap();
        assert_eq!(outlet.tokens(), 0);
        assert_eq!(inlet.pull().unwrap(), Signal::Item(7));
    }

    #[test]
    fn test_detached_when_inlet_dropped() {
        let cancel = CancelToken::new();
        let (mut outlet, inlet) = link::<u32>(&cancel);
        drop(inlet);
        assert_eq!(outlet.await_demand().unwrap(), Demand::Detached);
        assert_eq!(outlet.push(1).unwrap(), Demand::Detached);
    }

    #[test]
    fn test_upstream_lost_when_outlet_dropped() {
        let cancel = CancelToken::new();
        let (outlet, mut inlet) = link::<u32>(&cancel);
        drop(outlet);
        assert_eq!(
            inlet.pull().unwrap(),
            Signal::Failed(StreamFailure::UpstreamLost)
        );
    }

    #[test]
    fn test_failure_passes_without_demand() {
        let cancel = CancelToken::new();
        let (outlet, mut inlet) = link::<u32>(&cancel);
        outlet.fail(StreamFailure::UpstreamLost).unwrap();
        assert_eq!(
            inlet.pull().unwrap(),
            Signal::Failed(StreamFailure::UpstreamLost)
        );
    }

    #[test]
    fn test_cancel_unblocks_waiting_outlet() {
        let cancel = CancelToken::new();
        let (mut outlet, _inlet) = link::<u32>(&cancel);
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert!(matches!(outlet.push(1), Err(PipelineError::Cancelled)));
        handle.join().unwrap();
    }
}
