//! # tape_checkpoint: Checkpointing and Replay Scheduling
//!
//! Decides what forward-pass state the adjoint tape retains, in which tier,
//! and how the rest is regenerated by partial forward replay.
//!
//! # Key Components
//!
//! - [`CheckpointStorage`]: initial conditions and non-linear dependency
//!   data of the current epoch
//! - [`ReplayStorage`]: values live during a forward replay, released after
//!   their last consumer
//! - [`schedule`]: the memory, periodic and binomial snapshot schedules
//! - [`tier`]: fast (memory) and slow (disk) snapshot tiers
//! - [`CheckpointConfig`]: mode selection and parameters
//!
//! # Example
//!
//! ```
//! use tape_checkpoint::schedule::{extra_steps, simulate};
//! use tape_checkpoint::CheckpointConfig;
//!
//! let config = CheckpointConfig::binomial(100, 5, 0);
//! let mut schedule = config.build_schedule().unwrap();
//! let trace = simulate(schedule.as_mut(), 100).unwrap();
//! assert_eq!(Some(trace.replayed_blocks as u64), extra_steps(100, 5));
//! ```

pub mod config;
pub mod replay;
pub mod schedule;
pub mod storage;
pub mod tier;

pub use config::{CheckpointConfig, CheckpointMode, SnapshotFormat, DEFAULT_TIER_PATH};
pub use replay::ReplayStorage;
pub use schedule::{
    CheckpointDriver, CheckpointSchedule, Snapshot, SnapshotLoad, Tier,
};
pub use storage::{CheckpointStorage, ClearScope, StoredValue};
pub use tier::{DiskTier, MemoryTier, SnapshotEntries, SnapshotTier, SnapshotTiers, SpaceRegistry};
