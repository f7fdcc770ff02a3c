//! Checkpointing configuration.
//!
//! Handles loading the checkpointing mode and its parameters from TOML
//! files and environment variables, and turns a validated configuration into
//! a [`CheckpointSchedule`].
//!
//! # TOML
//!
//! ```toml
//! mode = "binomial"
//! total_blocks = 200
//! fast_capacity = 4
//! slow_capacity = 8
//! tier_path = "checkpoints~"
//! format = "binary"
//! verbose = true
//! ```

use crate::schedule::{BinomialSchedule, CheckpointSchedule, MemorySchedule, PeriodicSchedule};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tape_core::{TapeError, TapeResult};

/// Default slow-tier directory.
pub const DEFAULT_TIER_PATH: &str = "checkpoints~";

/// Checkpointing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointMode {
    /// Record everything in memory.
    #[default]
    AllInMemory,
    /// Slow-tier snapshots every `period` blocks.
    Periodic,
    /// Multistage binomial schedule over a known number of blocks.
    Binomial,
}

impl FromStr for CheckpointMode {
    type Err = TapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all-in-memory" | "memory" => Ok(CheckpointMode::AllInMemory),
            "periodic" | "periodic-disk" => Ok(CheckpointMode::Periodic),
            "binomial" | "multistage" => Ok(CheckpointMode::Binomial),
            _ => Err(TapeError::UnrecognizedMode(s.to_string())),
        }
    }
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::AllInMemory => "all-in-memory",
            CheckpointMode::Periodic => "periodic",
            CheckpointMode::Binomial => "binomial",
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Slow-tier file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// Compact binary encoding (bincode).
    #[default]
    Binary,
    /// Self-describing JSON container.
    Json,
}

impl FromStr for SnapshotFormat {
    type Err = TapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" | "bincode" => Ok(SnapshotFormat::Binary),
            "json" => Ok(SnapshotFormat::Json),
            _ => Err(TapeError::UnrecognizedFormat(s.to_string())),
        }
    }
}

impl SnapshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotFormat::Binary => "binary",
            SnapshotFormat::Json => "json",
        }
    }

    /// File extension of slow-tier snapshots.
    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Binary => "bin",
            SnapshotFormat::Json => "json",
        }
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Checkpointing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpointing strategy
    #[serde(deserialize_with = "deserialize_mode")]
    pub mode: CheckpointMode,
    /// Blocks per slow-tier snapshot (periodic)
    pub period: Option<usize>,
    /// Total number of blocks (binomial)
    pub total_blocks: Option<usize>,
    /// In-memory snapshot slots (binomial)
    pub fast_capacity: usize,
    /// On-disk snapshot slots (binomial)
    pub slow_capacity: usize,
    /// Directory for slow-tier snapshots
    pub tier_path: PathBuf,
    /// Slow-tier file format
    #[serde(deserialize_with = "deserialize_format")]
    pub format: SnapshotFormat,
    /// Log schedule events at info level
    pub verbose: bool,
}

fn deserialize_mode<'de, D>(deserializer: D) -> Result<CheckpointMode, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    CheckpointMode::from_str(&s).map_err(serde::de::Error::custom)
}

fn deserialize_format<'de, D>(deserializer: D) -> Result<SnapshotFormat, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    SnapshotFormat::from_str(&s).map_err(serde::de::Error::custom)
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            mode: CheckpointMode::AllInMemory,
            period: None,
            total_blocks: None,
            fast_capacity: 0,
            slow_capacity: 0,
            tier_path: PathBuf::from(DEFAULT_TIER_PATH),
            format: SnapshotFormat::Binary,
            verbose: false,
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> TapeResult<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| {
            TapeError::InvalidParameter(format!("{} has invalid value {:?}", name, value))
        }),
        Err(_) => Ok(None),
    }
}

impl CheckpointConfig {
    /// Record everything in memory.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Slow-tier snapshot every `period` blocks.
    pub fn periodic(period: usize) -> Self {
        Self {
            mode: CheckpointMode::Periodic,
            period: Some(period),
            ..Self::default()
        }
    }

    /// Binomial schedule over `total_blocks` blocks.
    pub fn binomial(total_blocks: usize, fast_capacity: usize, slow_capacity: usize) -> Self {
        Self {
            mode: CheckpointMode::Binomial,
            total_blocks: Some(total_blocks),
            fast_capacity,
            slow_capacity,
            ..Self::default()
        }
    }

    pub fn with_tier_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tier_path = path.into();
        self
    }

    pub fn with_format(mut self, format: SnapshotFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> TapeResult<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| config_error(e.message()))?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn from_file(path: &Path) -> TapeResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Applies `TAPE_*` environment variables on top of `self`.
    pub fn apply_env(mut self) -> TapeResult<Self> {
        if let Ok(mode) = std::env::var("TAPE_CHECKPOINT_MODE") {
            self.mode = mode.trim().parse()?;
        }
        if let Some(period) = parse_env("TAPE_PERIOD")? {
            self.period = Some(period);
        }
        if let Some(total) = parse_env("TAPE_TOTAL_BLOCKS")? {
            self.total_blocks = Some(total);
        }
        if let Some(fast) = parse_env("TAPE_FAST_CAPACITY")? {
            self.fast_capacity = fast;
        }
        if let Some(slow) = parse_env("TAPE_SLOW_CAPACITY")? {
            self.slow_capacity = slow;
        }
        if let Ok(path) = std::env::var("TAPE_TIER_PATH") {
            self.tier_path = PathBuf::from(path);
        }
        if let Ok(format) = std::env::var("TAPE_FORMAT") {
            self.format = format.trim().parse()?;
        }
        if let Some(verbose) = parse_env("TAPE_VERBOSE")? {
            self.verbose = verbose;
        }
        Ok(self)
    }

    /// Loads from environment variables only.
    pub fn from_env() -> TapeResult<Self> {
        Self::default().apply_env()
    }

    /// Checks the parameters required by the selected mode.
    pub fn validate(&self) -> TapeResult<()> {
        match self.mode {
            CheckpointMode::AllInMemory => Ok(()),
            CheckpointMode::Periodic => match self.period {
                Some(p) if p >= 1 => Ok(()),
                Some(_) => Err(TapeError::InvalidParameter(
                    "period must be at least 1".to_string(),
                )),
                None => Err(TapeError::InvalidParameter(
                    "periodic checkpointing requires a period".to_string(),
                )),
            },
            CheckpointMode::Binomial => {
                let total = self.total_blocks.ok_or_else(|| {
                    TapeError::InvalidParameter(
                        "binomial checkpointing requires total_blocks".to_string(),
                    )
                })?;
                if total == 0 {
                    return Err(TapeError::InvalidParameter(
                        "total_blocks must be at least 1".to_string(),
                    ));
                }
                if total > 1 && self.fast_capacity + self.slow_capacity == 0 {
                    return Err(TapeError::InvalidParameter(format!(
                        "binomial checkpointing of {} blocks requires at least one snapshot slot",
                        total
                    )));
                }
                Ok(())
            }
        }
    }

    /// Whether the configuration may write to the slow tier.
    pub fn uses_slow_tier(&self) -> bool {
        match self.mode {
            CheckpointMode::AllInMemory => false,
            CheckpointMode::Periodic => true,
            CheckpointMode::Binomial => self.slow_capacity > 0,
        }
    }

    /// Builds the schedule for this configuration.
    pub fn build_schedule(&self) -> TapeResult<Box<dyn CheckpointSchedule>> {
        self.validate()?;
        Ok(match self.mode {
            CheckpointMode::AllInMemory => Box::new(MemorySchedule::new()),
            CheckpointMode::Periodic => Box::new(
                PeriodicSchedule::new(self.period.unwrap_or(1))?.with_verbose(self.verbose),
            ),
            CheckpointMode::Binomial => Box::new(
                BinomialSchedule::new(
                    self.total_blocks.unwrap_or(1),
                    self.fast_capacity,
                    self.slow_capacity,
                )?
                .with_verbose(self.verbose),
            ),
        })
    }
}

fn config_error(message: &str) -> TapeError {
    // Unknown mode or format names surface through serde as custom errors.
    if let Some(mode) = message.strip_prefix("Unrecognized checkpointing mode: ") {
        TapeError::UnrecognizedMode(mode.trim().to_string())
    } else if let Some(format) = message.strip_prefix("Unrecognized snapshot format: ") {
        TapeError::UnrecognizedFormat(format.trim().to_string())
    } else {
        TapeError::InvalidParameter(format!("configuration file error: {}", message.trim()))
    }
}
