//! Priority tiers and their scheduling parameters.
//!
//! Every region is registered at exactly one tier. The tier decides how close
//! to the viewport a region must get before it is considered relevant, how
//! many regions of that tier may load at once, and how long the tier waits
//! between admission batches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Urgency level of a region, most urgent first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Must be visible now
    Critical = 0,
    /// About to scroll into view
    High = 1,
    /// Standard content
    #[default]
    Normal = 2,
    /// Below the fold
    Low = 3,
    /// Far outside the viewport
    Background = 4,
}

impl Tier {
    /// All tiers, most urgent first
    pub const ALL: [Tier; 5] = [Tier::Critical, Tier::High, Tier::Normal, Tier::Low, Tier::Background];

    /// Position of the tier in [`Tier::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase tier name
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Critical => "critical",
            Tier::High => "high",
            Tier::Normal => "normal",
            Tier::Low => "low",
            Tier::Background => "background",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Tier::Critical),
            "high" => Ok(Tier::High),
            "normal" => Ok(Tier::Normal),
            "low" => Ok(Tier::Low),
            "background" => Ok(Tier::Background),
            other => Err(ConfigurationError::UnknownTier(other.to_string())),
        }
    }
}

/// Behavioral parameters of one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum regions of this tier loading at the same time
    pub batch_size: usize,

    /// Minimum spacing between two admission batches
    #[serde(with = "duration_ms")]
    pub inter_batch_delay: Duration,

    /// Distance in pixels outside the viewport at which a region becomes relevant.
    /// Zero means the region has to intersect the viewport.
    pub proximity_threshold: f64,
}

impl TierConfig {
    pub fn new(batch_size: usize, inter_batch_delay: Duration, proximity_threshold: f64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            inter_batch_delay,
            proximity_threshold: proximity_threshold.max(0.0),
        }
    }
}

/// Static table mapping every tier to its [`TierConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    configs: [TierConfig; 5],
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            configs: [
                TierConfig::new(10, Duration::ZERO, 0.0),
                TierConfig::new(8, Duration::from_millis(50), 200.0),
                TierConfig::new(5, Duration::from_millis(100), 500.0),
                TierConfig::new(3, Duration::from_millis(200), 1000.0),
                TierConfig::new(2, Duration::from_millis(500), 2000.0),
            ],
        }
    }
}

impl TierTable {
    /// Config for a tier
    pub fn get(&self, tier: Tier) -> &TierConfig {
        &self.configs[tier.index()]
    }

    /// Replace the config of one tier
    pub fn with(mut self, tier: Tier, config: TierConfig) -> Self {
        self.configs[tier.index()] = config;
        self
    }

    /// Iterate tiers with their configs, most urgent first
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &TierConfig)> {
        Tier::ALL.iter().map(move |tier| (*tier, &self.configs[tier.index()]))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
