use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ferry_protocol::FerryError;
use serde::{Deserialize, Serialize};

/// Throughput preset for the chunked engine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ThroughputPreset {
    #[serde(rename = "low")]
    Low,
    #[default]
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl ThroughputPreset {
    /// Presets from the most conservative to the most aggressive.
    pub const ORDER: [ThroughputPreset; 3] = [Self::Low, Self::Medium, Self::High];

    /// Number of parallel connections.
    pub fn connections(&self) -> usize {
        match self {
            Self::Low => 4,
            Self::Medium => 8,
            Self::High => 12,
        }
    }

    /// Size of each chunk in bytes.
    pub fn chunk_size(&self) -> u64 {
        match self {
            Self::Low => 2 * 1024 * 1024,
            Self::Medium => 4 * 1024 * 1024,
            Self::High => 8 * 1024 * 1024,
        }
    }

    /// One step more conservative, or `None` at [`Low`](Self::Low).
    pub fn lower(&self) -> Option<Self> {
        match self {
            Self::Low => None,
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
        }
    }

    /// One step more aggressive, or `None` at [`High`](Self::High).
    pub fn higher(&self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for ThroughputPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThroughputPreset {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(FerryError::validation(format!("unknown preset '{other}'"))),
        }
    }
}

/// Tunables of the chunked engine.
///
/// `connections` and `chunk_size` override the preset when set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedConfig {
    pub preset: ThroughputPreset,
    pub connections: Option<usize>,
    pub chunk_size: Option<u64>,
    /// Workers started per warm-up batch.
    pub warmup_batch: usize,
    /// Pause between warm-up batches.
    pub warmup_delay: Duration,
    /// Extra attempts per chunk before the task fails.
    pub max_chunk_retries: u32,
    /// Connect attempts per worker session.
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    /// Connect failures after which the worker cap is halved.
    pub degrade_after_failures: usize,
    pub min_workers: usize,
    /// Minimum spacing of aggregate progress updates.
    pub progress_interval: Duration,
}

impl Default for ChunkedConfig {
    fn default() -> Self {
        Self {
            preset: ThroughputPreset::default(),
            connections: None,
            chunk_size: None,
            warmup_batch: 3,
            warmup_delay: Duration::from_millis(250),
            max_chunk_retries: 3,
            connect_retries: 3,
            connect_backoff: Duration::from_millis(400),
            degrade_after_failures: 2,
            min_workers: 2,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl ChunkedConfig {
    pub fn with_preset(preset: ThroughputPreset) -> Self {
        Self {
            preset,
            ..Self::default()
        }
    }

    pub fn effective_connections(&self) -> usize {
        self.connections.unwrap_or(self.preset.connections()).max(1)
    }

    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(self.preset.chunk_size()).max(1)
    }

    /// Delay before connect attempt `attempt + 1` (1-based `attempt`).
    pub fn connect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.connect_backoff * 2u32.pow(exp)
    }
}
