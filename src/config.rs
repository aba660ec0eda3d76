//! Scenario files: declarative topologies over integer items.
//!
//! A scenario file is TOML with one `[[topology]]` table per topology.
//! Durations are given in milliseconds.
//!
//! ```toml
//! [[topology]]
//! name = "fan-out"
//! items = 30
//! tick_period_ms = 200
//! producer_delay = { kind = "uniform", min_ms = 0, max_ms = 50 }
//!
//! [[topology.branch]]
//! name = "slow"
//! delay = { kind = "constant", ms = 300 }
//! buffer = { capacity = 2, policy = "drop-newest" }
//!
//! [[topology.branch]]
//! name = "fast"
//! delay = { kind = "constant", ms = 10 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::buffer::OverflowPolicy;
use crate::consumer::{FailurePolicy, FnConsumer};
use crate::delay::DelayModel;
use crate::error::{ConsumerError, PipelineError, ProductionError, Result};
use crate::pipeline::{BranchSpec, Topology, TopologyBuilder};
use crate::producer::Producer;

fn default_tick_period_ms() -> u64 {
    200
}

/// Per-item delay as written in a scenario file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DelayConfig {
    #[default]
    Zero,
    Constant {
        ms: u64,
    },
    Linear {
        base_ms: u64,
        step_ms: u64,
    },
    Uniform {
        min_ms: u64,
        max_ms: u64,
    },
}

impl DelayConfig {
    pub fn to_model(self) -> DelayModel {
        match self {
            DelayConfig::Zero => DelayModel::Zero,
            DelayConfig::Constant { ms } => DelayModel::constant_ms(ms),
            DelayConfig::Linear { base_ms, step_ms } => DelayModel::Linear {
                base: Duration::from_millis(base_ms),
                step: Duration::from_millis(step_ms),
            },
            DelayConfig::Uniform { min_ms, max_ms } => DelayModel::uniform_ms(min_ms, max_ms),
        }
    }
}

/// Buffer in front of a branch's consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub capacity: usize,
    #[serde(default = "default_policy")]
    pub policy: OverflowPolicy,
}

fn default_policy() -> OverflowPolicy {
    OverflowPolicy::Block
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,

    /// Simulated processing time per item
    #[serde(default)]
    pub delay: DelayConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferConfig>,

    /// Reject the item with this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub name: String,

    /// Produce `1..=items`; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<u64>,

    /// The generator fails instead of producing this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_at: Option<u64>,

    #[serde(default)]
    pub producer_delay: DelayConfig,

    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    #[serde(default)]
    pub initial_delay_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default, rename = "branch")]
    pub branches: Vec<BranchConfig>,
}

impl TopologyConfig {
    fn producer(&self) -> Producer<u64> {
        let values: Box<dyn Iterator<Item = u64> + Send> = match self.items {
            Some(count) => Box::new(1..=count),
            None => Box::new(1..),
        };
        let fail_at = self.fail_at;
        Producer::fallible(values.map(move |value| {
            if Some(value) == fail_at {
                Err(ProductionError::new(format!(
                    "generator failed at item {}",
                    value
                )))
            } else {
                Ok(value)
            }
        }))
        .with_delay(self.producer_delay.to_model())
    }

    fn branch(config: &BranchConfig) -> BranchSpec<u64> {
        let fail_at = config.fail_at;
        let consumer = FnConsumer::new(move |item: u64| {
            if Some(item) == fail_at {
                Err(ConsumerError::new(format!("rejected item {}", item)))
            } else {
                Ok(())
            }
        });

        let spec =
            BranchSpec::new(config.name.clone(), consumer).with_delay(config.delay.to_model());
        match config.buffer {
            Some(buffer) => spec.with_buffer(buffer.capacity, buffer.policy),
            None => spec,
        }
    }

    /// Build and validate the topology this table describes
    pub fn to_topology(&self) -> Result<Topology<u64>> {
        let builder = TopologyBuilder::new(self.name.clone())
            .producer(self.producer())
            .tick_period(Duration::from_millis(self.tick_period_ms))
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .failure_policy(self.failure_policy);

        self.branches
            .iter()
            .fold(builder, |builder, branch| builder.branch(Self::branch(branch)))
            .build()
    }
}

/// A list of topologies loaded from TOML
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScenarioFile {
    #[serde(default, rename = "topology")]
    pub topologies: Vec<TopologyConfig>,
}

impl ScenarioFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::ScenarioIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: ScenarioFile = toml::from_str(content)?;
        if file.topologies.is_empty() {
            return Err(PipelineError::ConfigError(
                "scenario file declares no topology".into(),
            ));
        }
        Ok(file)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to serialize scenarios: {}", e))
        })
    }

    /// Keep only the named topologies
    pub fn retain(&mut self, names: &[String]) {
        if !names.is_empty() {
            self.topologies.retain(|t| names.contains(&t.name));
        }
    }

    /// Build every topology, failing on the first invalid one
    pub fn to_topologies(&self) -> Result<Vec<Topology<u64>>> {
        self.topologies.iter().map(TopologyConfig::to_topology).collect()
    }

    /// The reference scenarios: a rate-limited single consumer, and fan-out
    /// to a slow buffered branch next to fast unbuffered ones
    pub fn reference() -> Self {
        let fast = |name: &str| BranchConfig {
            name: name.into(),
            delay: DelayConfig::Constant { ms: 10 },
            buffer: None,
            fail_at: None,
        };

        Self {
            topologies: vec![
                TopologyConfig {
                    name: "rate-limited".into(),
                    items: Some(100),
                    fail_at: None,
                    producer_delay: DelayConfig::Uniform { min_ms: 0, max_ms: 50 },
                    tick_period_ms: 200,
                    initial_delay_ms: 0,
                    failure_policy: FailurePolicy::IsolateBranch,
                    branches: vec![fast("sink")],
                },
                TopologyConfig {
                    name: "fan-out-drop-newest".into(),
                    items: Some(30),
                    fail_at: None,
                    producer_delay: DelayConfig::Zero,
                    tick_period_ms: 200,
                    initial_delay_ms: 0,
                    failure_policy: FailurePolicy::IsolateBranch,
                    branches: vec![
                        BranchConfig {
                            name: "slow".into(),
                            delay: DelayConfig::Constant { ms: 300 },
                            buffer: Some(BufferConfig {
                                capacity: 2,
                                policy: OverflowPolicy::DropNewest,
                            }),
                            fail_at: None,
                        },
                        fast("fast-1"),
                        fast("fast-2"),
                    ],
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[topology]]
name = "fan-out"
items = 30
tick_period_ms = 50
producer_delay = { kind = "uniform", min_ms = 0, max_ms = 5 }
failure_policy = "cancel-topology"

[[topology.branch]]
name = "slow"
delay = { kind = "constant", ms = 300 }
buffer = { capacity = 2, policy = "drop-newest" }

[[topology.branch]]
name = "fast"
fail_at = 7

[[topology]]
name = "defaults"
[[topology.branch]]
name = "only"
buffer = { capacity = 4 }
"#;

    #[test]
    fn test_parse_scenarios() {
        let file = ScenarioFile::parse(SAMPLE).unwrap();
        assert_eq!(file.topologies.len(), 2);

        let fan_out = &file.topologies[0];
        assert_eq!(fan_out.items, Some(30));
        assert_eq!(fan_out.failure_policy, FailurePolicy::CancelTopology);
        assert_eq!(
            fan_out.producer_delay,
            DelayConfig::Uniform { min_ms: 0, max_ms: 5 }
        );
        assert_eq!(
            fan_out.branches[0].buffer,
            Some(BufferConfig {
                capacity: 2,
                policy: OverflowPolicy::DropNewest
            })
        );
        assert_eq!(fan_out.branches[1].delay, DelayConfig::Zero);
        assert_eq!(fan_out.branches[1].fail_at, Some(7));

        let defaults = &file.topologies[1];
        assert_eq!(defaults.tick_period_ms, 200);
        assert_eq!(defaults.items, None);
        assert_eq!(defaults.failure_policy, FailurePolicy::IsolateBranch);
        assert_eq!(defaults.branches[0].buffer.unwrap().policy, OverflowPolicy::Block);
    }

    #[test]
    fn test_build_topologies() {
        let topologies = ScenarioFile::parse(SAMPLE).unwrap().to_topologies().unwrap();
        assert_eq!(topologies[0].name(), "fan-out");
        assert_eq!(topologies[0].degree(), 2);
    }

    #[test]
    fn test_unknown_delay_kind_rejected() {
        let result = ScenarioFile::parse(
            r#"
[[topology]]
name = "bad"
producer_delay = { kind = "exponential", ms = 3 }
"#,
        );
        assert!(matches!(result, Err(PipelineError::ScenarioParse(_))));
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(
            ScenarioFile::parse(""),
            Err(PipelineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_invalid_topology_rejected_on_build() {
        let file = ScenarioFile::parse(
            r#"
[[topology]]
name = "no-branches"
"#,
        )
        .unwrap();
        assert!(matches!(
            file.to_topologies(),
            Err(PipelineError::NoBranches(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = ScenarioFile::load("/nonexistent/scenarios.toml");
        assert!(matches!(result, Err(PipelineError::ScenarioIo { .. })));
    }

    #[test]
    fn test_reference_round_trips_through_toml() {
        let reference = ScenarioFile::reference();
        let text = reference.to_toml().unwrap();
        assert_eq!(ScenarioFile::parse(&text).unwrap(), reference);
        assert_eq!(reference.to_topologies().unwrap().len(), 2);
    }

    #[test]
    fn test_retain_by_name() {
        let mut file = ScenarioFile::reference();
        file.retain(&["fan-out-drop-newest".to_string()]);
        assert_eq!(file.topologies.len(), 1);
        file.retain(&[]);
        assert_eq!(file.topologies.len(), 1);
    }
}
