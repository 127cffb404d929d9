//! Ferry configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/ferry/ferry.toml`. A default file is written on first use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferry_file_ops::expand_home;
use ferry_protocol::SandboxBoundary;
use ferry_scheduler::SchedulerConfig;
use ferry_transfer::{ChunkedConfig, DEFAULT_CHUNK_THRESHOLD, ThroughputPreset};

/// Ferry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Remote directory every task is confined to.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,

    /// Local directory that stands in for the remote filesystem.
    #[serde(default = "default_target_mount")]
    pub target_mount: String,

    /// Where chunked transfer checkpoints and the preset history live.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    #[serde(default = "default_protocol_workers")]
    pub protocol_workers: usize,

    #[serde(default = "default_chunked_concurrency")]
    pub chunked_concurrency: usize,

    /// Files of at least this many bytes use the chunked engine.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,

    #[serde(default)]
    pub preset: ThroughputPreset,

    /// Let recent transfer outcomes move the preset.
    #[serde(default = "default_true")]
    pub adaptive_preset: bool,

    /// Overrides the preset's chunk size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    /// Overrides the preset's connection count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,

    #[serde(default = "default_warmup_batch")]
    pub warmup_batch: usize,

    #[serde(default = "default_warmup_delay_ms")]
    pub warmup_delay_ms: u64,

    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,

    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_sandbox_root() -> String {
    "/".into()
}

fn default_target_mount() -> String {
    "~/.local/share/ferry/target".into()
}

fn default_checkpoint_dir() -> String {
    "~/.local/share/ferry/checkpoints".into()
}

fn default_protocol_workers() -> usize {
    SchedulerConfig::default().protocol_workers
}

fn default_chunked_concurrency() -> usize {
    SchedulerConfig::default().chunked_concurrency
}

fn default_chunk_threshold() -> u64 {
    DEFAULT_CHUNK_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_warmup_batch() -> usize {
    ChunkedConfig::default().warmup_batch
}

fn default_warmup_delay_ms() -> u64 {
    ChunkedConfig::default().warmup_delay.as_millis() as u64
}

fn default_max_chunk_retries() -> u32 {
    ChunkedConfig::default().max_chunk_retries
}

fn default_progress_interval_ms() -> u64 {
    ChunkedConfig::default().progress_interval.as_millis() as u64
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            target_mount: default_target_mount(),
            checkpoint_dir: default_checkpoint_dir(),
            protocol_workers: default_protocol_workers(),
            chunked_concurrency: default_chunked_concurrency(),
            chunk_threshold: default_chunk_threshold(),
            preset: ThroughputPreset::default(),
            adaptive_preset: true,
            chunk_size: None,
            connections: None,
            warmup_batch: default_warmup_batch(),
            warmup_delay_ms: default_warmup_delay_ms(),
            max_chunk_retries: default_max_chunk_retries(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl FerryConfig {
    /// Loads configuration from `path`, or writes and returns the default if
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: FerryConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = FerryConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        SandboxBoundary::new(&self.sandbox_root)?;
        anyhow::ensure!(self.protocol_workers >= 1, "protocol_workers must be at least 1");
        anyhow::ensure!(
            self.chunked_concurrency >= 1,
            "chunked_concurrency must be at least 1"
        );
        anyhow::ensure!(self.chunk_threshold > 0, "chunk_threshold must be positive");
        if let Some(size) = self.chunk_size {
            anyhow::ensure!(size > 0, "chunk_size must be positive");
        }
        if let Some(n) = self.connections {
            anyhow::ensure!(n >= 1, "connections must be at least 1");
        }
        Ok(())
    }

    pub fn boundary(&self) -> anyhow::Result<SandboxBoundary> {
        Ok(SandboxBoundary::new(&self.sandbox_root)?)
    }

    pub fn target_mount(&self) -> PathBuf {
        expand_home(&self.target_mount)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        expand_home(&self.checkpoint_dir)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            protocol_workers: self.protocol_workers,
            chunked_concurrency: self.chunked_concurrency,
            chunk_threshold: self.chunk_threshold,
            ..SchedulerConfig::default()
        }
    }

    /// Chunked engine tunables, starting from `preset`.
    pub fn chunked_config(&self, preset: ThroughputPreset) -> ChunkedConfig {
        ChunkedConfig {
            preset,
            connections: self.connections,
            chunk_size: self.chunk_size,
            warmup_batch: self.warmup_batch,
            warmup_delay: Duration::from_millis(self.warmup_delay_ms),
            max_chunk_retries: self.max_chunk_retries,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            ..ChunkedConfig::default()
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    expand_home("~/.config/ferry/ferry.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = FerryConfig::default();
        assert_eq!(config.sandbox_root, "/");
        assert_eq!(config.protocol_workers, 4);
        assert_eq!(config.chunked_concurrency, 1);
        assert_eq!(config.chunk_threshold, 50 * 1024 * 1024);
        assert_eq!(config.preset, ThroughputPreset::Medium);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/ferry.toml");
        let config = FerryConfig::load(&path).unwrap();
        assert_eq!(config, FerryConfig::default());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = FerryConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            "sandbox_root = \"/srv/app\"\npreset = \"high\"\nchunk_size = 1048576\n",
        )
        .unwrap();
        let config = FerryConfig::load(&path).unwrap();
        assert_eq!(config.sandbox_root, "/srv/app");
        assert_eq!(config.preset, ThroughputPreset::High);
        assert_eq!(config.protocol_workers, 4);

        let chunked = config.chunked_config(config.preset);
        assert_eq!(chunked.effective_chunk_size(), 1048576);
        assert_eq!(chunked.warmup_delay, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(&path, "sandbox_root = \"relative/root\"\n").unwrap();
        assert!(FerryConfig::load(&path).is_err());

        std::fs::write(&path, "protocol_workers = 0\n").unwrap();
        assert!(FerryConfig::load(&path).is_err());
    }
}
