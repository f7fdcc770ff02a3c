//! Check command implementation
//!
//! Resolves the checkpointing configuration from all sources, validates it
//! by building its schedule, and prints it.

use tape_checkpoint::schedule::allocate_tiers;
use tape_checkpoint::{CheckpointConfig, CheckpointMode};
use tracing::info;

use crate::Result;

/// Run the check command
pub fn run(config: &CheckpointConfig, json: bool) -> Result<()> {
    let schedule = config.build_schedule()?;
    info!(mode = %schedule.mode(), "Configuration is valid");

    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("Mode:         {}", config.mode);
    match config.mode {
        CheckpointMode::AllInMemory => {}
        CheckpointMode::Periodic => {
            println!("Period:       {}", config.period.unwrap_or_default());
        }
        CheckpointMode::Binomial => {
            let total = config.total_blocks.unwrap_or_default();
            println!("Total blocks: {}", total);
            println!("Fast slots:   {}", config.fast_capacity);
            println!("Slow slots:   {}", config.slow_capacity);
            let tiers = allocate_tiers(total, config.fast_capacity, config.slow_capacity)?;
            let tiers: Vec<String> = tiers.iter().map(ToString::to_string).collect();
            println!("Slot tiers:   [{}]", tiers.join(", "));
        }
    }
    if config.uses_slow_tier() {
        println!("Tier path:    {}", config.tier_path.display());
        println!("Format:       {}", config.format);
    }
    println!("Verbose:      {}", config.verbose);
    Ok(())
}
