//! Adaptive throughput preset selection.
//!
//! Keeps a bounded history of chunked transfer outcomes and moves the preset
//! one step down when recent transfers on it fail too often, or one step up
//! when they almost always succeed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ferry_transfer::ThroughputPreset;

/// Records kept in the history.
pub const MAX_RECORDS: usize = 100;
/// Most recent records on the current preset considered for a decision.
pub const SAMPLE_WINDOW: usize = 10;
/// Below this success rate the preset steps down.
pub const DOWNGRADE_BELOW: f64 = 0.80;
/// At or above this success rate the preset steps up.
pub const UPGRADE_AT: f64 = 0.95;
pub const MIN_SAMPLES: usize = 3;
/// Minimum spacing between two preset changes.
pub const COOLDOWN: Duration = Duration::from_secs(300);

/// File name used next to the checkpoints.
pub const ADVISOR_FILE: &str = "preset_history.json";

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one chunked transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub preset: ThroughputPreset,
    pub bytes: u64,
    pub duration_secs: f64,
    pub success: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvisorState {
    #[serde(default = "default_preset")]
    current: ThroughputPreset,
    #[serde(default)]
    records: VecDeque<TransferRecord>,
    #[serde(default)]
    last_change: Option<DateTime<Utc>>,
}

fn default_preset() -> ThroughputPreset {
    ThroughputPreset::Low
}

/// Recommends a [`ThroughputPreset`] from recent transfer outcomes.
pub struct PresetAdvisor {
    path: Option<PathBuf>,
    state: AdvisorState,
}

impl PresetAdvisor {
    /// An advisor that keeps its history in memory only.
    pub fn new(initial: ThroughputPreset) -> Self {
        Self {
            path: None,
            state: AdvisorState {
                current: initial,
                ..AdvisorState::default()
            },
        }
    }

    /// Loads the history from `path`, starting fresh at the lowest preset if
    /// the file is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let state = match load_state(&path) {
            Ok(Some(state)) => state,
            Ok(None) => AdvisorState {
                current: default_preset(),
                ..AdvisorState::default()
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "preset history unreadable, starting fresh");
                AdvisorState {
                    current: default_preset(),
                    ..AdvisorState::default()
                }
            }
        };
        Self {
            path: Some(path),
            state,
        }
    }

    pub fn current(&self) -> ThroughputPreset {
        self.state.current
    }

    pub fn records(&self) -> impl Iterator<Item = &TransferRecord> {
        self.state.records.iter()
    }

    /// Success rate and sample count of the latest records on `preset`.
    pub fn success_rate(&self, preset: ThroughputPreset) -> Option<(f64, usize)> {
        let window: Vec<&TransferRecord> = self
            .state
            .records
            .iter()
            .rev()
            .filter(|r| r.preset == preset)
            .take(SAMPLE_WINDOW)
            .collect();
        if window.is_empty() {
            return None;
        }
        let ok = window.iter().filter(|r| r.success).count();
        Some((ok as f64 / window.len() as f64, window.len()))
    }

    /// Adds a record and re-evaluates. Returns the new preset if it changed.
    pub fn record(&mut self, record: TransferRecord) -> Option<ThroughputPreset> {
        let now = record.at;
        self.state.records.push_back(record);
        while self.state.records.len() > MAX_RECORDS {
            self.state.records.pop_front();
        }
        let changed = self.evaluate(now);
        if let Err(e) = self.persist() {
            warn!(error = %e, "could not persist preset history");
        }
        changed
    }

    fn evaluate(&mut self, now: DateTime<Utc>) -> Option<ThroughputPreset> {
        if let Some(last) = self.state.last_change {
            let since = now.signed_duration_since(last).to_std().unwrap_or_default();
            if since < COOLDOWN {
                return None;
            }
        }
        let current = self.state.current;
        let (rate, samples) = self.success_rate(current)?;
        if samples < MIN_SAMPLES {
            return None;
        }
        let next = if rate < DOWNGRADE_BELOW {
            current.lower()
        } else if rate >= UPGRADE_AT {
            current.higher()
        } else {
            None
        }?;
        info!(from = %current, to = %next, rate, samples, "preset recommendation changed");
        self.state.current = next;
        self.state.last_change = Some(now);
        Some(next)
    }

    fn persist(&self) -> Result<(), AdvisorError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.state)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(records = self.state.records.len(), path = %path.display(), "persisted preset history");
        Ok(())
    }
}

fn load_state(path: &Path) -> Result<Option<AdvisorState>, AdvisorError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}
