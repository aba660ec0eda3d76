use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Simulated per-item latency for producers and consumers
#[derive(Clone, Default)]
pub enum DelayModel {
    /// No delay at all
    #[default]
    Zero,
    /// The same delay for every item
    Constant(Duration),
    /// `base + step * index`, modelling a gradual slowdown
    Linear { base: Duration, step: Duration },
    /// Uniformly random in `[min, max]`
    Uniform { min: Duration, max: Duration },
    /// Arbitrary function of the item's zero-based index
    Custom(Arc<dyn Fn(u64) -> Duration + Send + Sync>),
}

impl DelayModel {
    pub fn constant_ms(ms: u64) -> Self {
        Self::Constant(Duration::from_millis(ms))
    }

    pub fn uniform_ms(min: u64, max: u64) -> Self {
        Self::Uniform {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u64) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Delay to apply before handling the item with the given index
    pub fn delay_for(&self, index: u64) -> Duration {
        match self {
            Self::Zero => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { base, step } => {
                let factor = u32::try_from(index).unwrap_or(u32::MAX);
                base.saturating_add(step.saturating_mul(factor))
            }
            Self::Uniform { min, max } => {
                if max <= min {
                    *min
                } else {
                    rand::thread_rng().gen_range(*min..=*max)
                }
            }
            Self::Custom(f) => f(index),
        }
    }
}

impl fmt::Debug for DelayModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "Zero"),
            Self::Constant(d) => write!(f, "Constant({:?})", d),
            Self::Linear { base, step } => write!(f, "Linear({:?} + {:?}/item)", base, step),
            Self::Uniform { min, max } => write!(f, "Uniform({:?}..={:?})", min, max),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}
