//! A demand-driven stream processing engine with explicit backpressure.
//!
//! A topology is a fixed chain: a producer, a rate limiter paced by a tick
//! gate, a broadcast splitter, and one consumer per branch, optionally behind
//! a bounded buffer. Every stage runs on its own thread. Items only move
//! downstream in answer to demand moving upstream, so a slow consumer either
//! throttles the whole chain or, behind a drop-policy buffer, loses items in
//! a bounded and counted way.
//!
//! # Features
//!
//! - Explicit one-outstanding-request demand protocol over bounded channels
//! - Drift-free tick gate; exactly one tick per emitted item
//! - Bounded branch buffers with Block, DropOldest or DropNewest overflow
//! - Branch-isolated or topology-wide consumer failure handling
//! - Cancellation that unwinds every blocked stage
//! - Pluggable observer for counters, timings and logs
//! - TOML scenario files
//!
//! # Example
//!
//! ```no_run
//! use demand_pipeline::{
//!     BranchSpec, Collector, DelayModel, NoopObserver, OverflowPolicy, PipelineRunner,
//!     Producer, TopologyBuilder,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let topology = TopologyBuilder::new("fan-out")
//!     .producer(Producer::new(1..=100u64))
//!     .tick_period(Duration::from_millis(200))
//!     .branch(
//!         BranchSpec::new("slow", Collector::new())
//!             .with_delay(DelayModel::constant_ms(300))
//!             .with_buffer(2, OverflowPolicy::DropNewest),
//!     )
//!     .branch(BranchSpec::new("fast", Collector::new()).with_delay(DelayModel::constant_ms(10)))
//!     .build()?;
//!
//! let runner = PipelineRunner::new(Arc::new(NoopObserver));
//! let report = runner.run(topology)?;
//! println!("{}", report.format());
//! # Ok::<(), demand_pipeline::PipelineError>(())
//! ```

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod consumer;
pub mod delay;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod link;
pub mod metrics;
pub mod observe;
pub mod pipeline;
pub mod producer;
pub mod runner;
pub mod splitter;
pub mod stage;
pub mod tick;

// Re-exports for convenience
pub use buffer::{BoundedBranchBuffer, BufferStats, OverflowPolicy};
pub use cancel::CancelToken;
pub use config::ScenarioFile;
pub use consumer::{BranchReport, BranchState, Collector, Consumer, FailurePolicy, FnConsumer};
pub use delay::DelayModel;
pub use error::{ConsumerError, PipelineError, ProductionError, Result, StreamFailure};
pub use executor::Executor;
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use observe::{Fanout, NoopObserver, Observer, SharedObserver, TracingObserver};
pub use pipeline::{
    BranchSpec, RunningTopology, Topology, TopologyBuilder, TopologyOutcome, TopologyReport,
};
pub use producer::Producer;
pub use runner::{PipelineRunner, RunReport};
pub use tick::{Tick, TickConfig, Ticks};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
