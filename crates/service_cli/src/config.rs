//! Resolution of the checkpointing configuration.
//!
//! Priority (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (`TAPE_*`)
//! 3. Config file
//! 4. Default values

use crate::{CliError, Result};
use std::path::PathBuf;
use tape_checkpoint::{CheckpointConfig, CheckpointMode, SnapshotFormat};

/// Checkpointing overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub mode: Option<String>,
    pub period: Option<usize>,
    pub total_blocks: Option<usize>,
    pub fast_capacity: Option<usize>,
    pub slow_capacity: Option<usize>,
    pub tier_path: Option<PathBuf>,
    pub format: Option<String>,
    pub verbose: bool,
}

fn merge_with_cli(config: &mut CheckpointConfig, cli: &CliArgs) -> Result<()> {
    if let Some(mode) = &cli.mode {
        config.mode = mode.parse::<CheckpointMode>()?;
    }
    if let Some(period) = cli.period {
        config.period = Some(period);
    }
    if let Some(total) = cli.total_blocks {
        config.total_blocks = Some(total);
    }
    if let Some(fast) = cli.fast_capacity {
        config.fast_capacity = fast;
    }
    if let Some(slow) = cli.slow_capacity {
        config.slow_capacity = slow;
    }
    if let Some(path) = &cli.tier_path {
        config.tier_path = path.clone();
    }
    if let Some(format) = &cli.format {
        config.format = format.parse::<SnapshotFormat>()?;
    }
    if cli.verbose {
        config.verbose = true;
    }
    Ok(())
}

/// Builds the configuration from all sources and validates it.
pub fn build_config(cli: &CliArgs) -> Result<CheckpointConfig> {
    let config = match &cli.config_file {
        Some(path) if !path.exists() => {
            return Err(CliError::FileNotFound(path.display().to_string()))
        }
        Some(path) => CheckpointConfig::from_file(path)?,
        None => CheckpointConfig::default(),
    };
    let mut config = config.apply_env()?;
    merge_with_cli(&mut config, cli)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_memory() {
        let config = build_config(&CliArgs::default()).unwrap();
        assert_eq!(config.mode, CheckpointMode::AllInMemory);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode = \"periodic\"\nperiod = 4\nformat = \"json\"").unwrap();

        let cli = CliArgs {
            config_file: Some(file.path().to_path_buf()),
            period: Some(7),
            ..CliArgs::default()
        };
        let config = build_config(&cli).unwrap();
        assert_eq!(config.mode, CheckpointMode::Periodic);
        assert_eq!(config.period, Some(7));
        assert_eq!(config.format, SnapshotFormat::Json);
    }

    #[test]
    fn test_missing_file_reported() {
        let cli = CliArgs {
            config_file: Some(PathBuf::from("/nonexistent/revolve.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(build_config(&cli), Err(CliError::FileNotFound(_))));
    }

    #[test]
    fn test_invalid_combination_rejected() {
        let cli = CliArgs {
            mode: Some("binomial".to_string()),
            ..CliArgs::default()
        };
        let err = build_config(&cli).unwrap_err();
        assert!(matches!(err, CliError::Tape(ref e) if e.is_configuration()));
    }
}
