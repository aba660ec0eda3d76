use thiserror::Error;

/// Result type for pipeline construction and execution
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned to the caller that builds and runs topologies
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Topology was declared without any branch
    #[error("Topology '{0}' has no branches")]
    NoBranches(String),

    /// Topology was declared without a producer
    #[error("Topology '{0}' has no producer")]
    NoProducer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A stage thread could not be spawned
    #[error("Failed to spawn stage '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// The executor was already shut down
    #[error("Executor has been shut down")]
    ExecutorShutDown,

    /// A stage thread panicked
    #[error("Stage '{0}' panicked")]
    StagePanic(String),

    /// The operation observed a cancellation request
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Scenario file could not be read
    #[error("Failed to read scenario file {path}: {source}")]
    ScenarioIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Scenario file could not be parsed
    #[error("Failed to parse scenario file: {0}")]
    ScenarioParse(#[from] toml::de::Error),
}

/// Error raised by a producer's generator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProductionError(pub String);

impl ProductionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error raised by a consumer's processing step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConsumerError(pub String);

impl ConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure travelling in-band down a stream, terminating every stage it reaches
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// The producer's generator failed
    #[error("Production failed: {0}")]
    Production(#[from] ProductionError),

    /// The upstream stage went away without completing
    #[error("Upstream stage terminated without completing")]
    UpstreamLost,
}
