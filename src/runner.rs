//! Drives one or more topologies to completion.

use std::fmt::Write as _;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::executor::Executor;
use crate::observe::SharedObserver;
use crate::pipeline::{RunningTopology, Topology, TopologyReport};

/// Owns the executor that runs every stage thread and the observer all
/// topologies report to. Topologies share nothing else.
pub struct PipelineRunner {
    executor: Executor,
    observer: SharedObserver,
}

impl PipelineRunner {
    pub fn new(observer: SharedObserver) -> Self {
        Self {
            executor: Executor::new("pipeline"),
            observer,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Start a topology without waiting for it
    pub fn spawn<T: Clone + Send + 'static>(
        &self,
        topology: Topology<T>,
    ) -> Result<RunningTopology> {
        topology.spawn(&self.executor, self.observer.clone())
    }

    /// Run one topology until every branch is terminal
    pub fn run<T: Clone + Send + 'static>(&self, topology: Topology<T>) -> Result<TopologyReport> {
        Ok(self.spawn(topology)?.wait())
    }

    /// Run topologies one after another, stopping early once the runner is
    /// shut down
    pub fn run_sequential<T, I>(&self, topologies: I) -> Result<RunReport>
    where
        T: Clone + Send + 'static,
        I: IntoIterator<Item = Topology<T>>,
    {
        let mut reports = Vec::new();
        for topology in topologies {
            match self.run(topology) {
                Ok(report) => reports.push(report),
                Err(PipelineError::ExecutorShutDown) if !reports.is_empty() => {
                    warn!("runner shut down, skipping remaining topologies");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(RunReport::new(reports))
    }

    /// Start every topology, then wait for all of them.
    ///
    /// If one fails to start, the ones already running are cancelled and
    /// waited before the error is returned.
    pub fn run_concurrent<T, I>(&self, topologies: I) -> Result<RunReport>
    where
        T: Clone + Send + 'static,
        I: IntoIterator<Item = Topology<T>>,
    {
        let mut running = Vec::new();
        for topology in topologies {
            match self.spawn(topology) {
                Ok(handle) => running.push(handle),
                Err(e) => {
                    warn!(error = %e, started = running.len(), "aborting concurrent run");
                    for handle in running {
                        handle.cancel();
                        handle.wait();
                    }
                    return Err(e);
                }
            }
        }
        Ok(RunReport::new(
            running.into_iter().map(RunningTopology::wait).collect(),
        ))
    }

    /// Cancel every topology started so far
    pub fn cancel_all(&self) {
        info!("cancelling all topologies");
        self.executor.cancel_all();
    }

    /// Cancel everything and refuse new topologies
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}

/// Reports of every topology of one run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub topologies: Vec<TopologyReport>,
}

impl RunReport {
    pub fn new(topologies: Vec<TopologyReport>) -> Self {
        Self { topologies }
    }

    pub fn topology(&self, name: &str) -> Option<&TopologyReport> {
        self.topologies.iter().find(|t| t.name == name)
    }

    /// 0 when no topology ended in an unrecovered failure, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.topologies.iter().any(TopologyReport::is_fatal) {
            1
        } else {
            0
        }
    }

    pub fn format(&self) -> String {
        let mut out = String::from("Run Summary:\n");
        for topology in &self.topologies {
            let _ = write!(out, "{}", topology.format());
        }
        out
    }
}
