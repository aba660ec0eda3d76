//! Runs the reference backpressure scenarios, or the topologies of a scenario
//! file, and exits non-zero if any topology ended in an unrecovered failure.

use clap::Parser;
use crossbeam::channel::{bounded, RecvTimeoutError};
use demand_pipeline::{
    Fanout, MetricsRecorder, PipelineError, PipelineRunner, ScenarioFile, TracingObserver,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "backpressure-demo", version, about)]
struct Cli {
    /// TOML scenario file; the reference scenarios run when omitted
    scenario: Option<PathBuf>,

    /// Run all topologies at the same time instead of one after another
    #[arg(long)]
    concurrent: bool,

    /// Only run the named topology (repeatable)
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print the reference scenarios as TOML and exit
    #[arg(long)]
    print_reference: bool,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,demand_pipeline=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<i32, PipelineError> {
    if cli.print_reference {
        print!("{}", ScenarioFile::reference().to_toml()?);
        return Ok(0);
    }

    let mut scenarios = match &cli.scenario {
        Some(path) => {
            tracing::info!("Loading scenarios from {:?}", path);
            ScenarioFile::load(path)?
        }
        None => ScenarioFile::reference(),
    };
    scenarios.retain(&cli.only);
    if scenarios.topologies.is_empty() {
        return Err(PipelineError::ConfigError(format!(
            "no topology matches {:?}",
            cli.only
        )));
    }
    let topologies = scenarios.to_topologies()?;

    let recorder = Arc::new(MetricsRecorder::new());
    let observer = Fanout::new()
        .with(Arc::new(TracingObserver))
        .with(recorder.clone());
    let runner = Arc::new(PipelineRunner::new(Arc::new(observer)));

    let (done_tx, done_rx) = bounded::<()>(0);
    let watchdog = cli.timeout.map(|secs| {
        let runner = Arc::clone(&runner);
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(Duration::from_secs(secs))
            {
                tracing::warn!("Timeout of {}s reached, cancelling", secs);
                runner.shutdown();
            }
        })
    });

    tracing::info!(
        "Running {} topologies {}",
        topologies.len(),
        if cli.concurrent { "concurrently" } else { "sequentially" }
    );
    let report = if cli.concurrent {
        runner.run_concurrent(topologies)
    } else {
        runner.run_sequential(topologies)
    };

    drop(done_tx);
    if let Some(handle) = watchdog {
        let _ = handle.join();
    }
    runner.shutdown();
    let report = report?;

    println!("{}", report.format());
    println!("Metrics:\n{}", recorder.snapshot().format());
    Ok(report.exit_code())
}
