//! Communicator abstraction for SPMD execution.
//!
//! Every rank runs the same tape with replicated block and snapshot
//! structure. The checkpoint layer only needs a handful of collectives: a
//! barrier before deleting slow-tier files, a gather used to detect ranks
//! that have drifted apart, and a broadcast of the manager id.

use crate::error::{TapeError, TapeResult};
use fnv::FnvHasher;
use std::fmt;
use std::hash::Hasher;

/// Collective operations used by the checkpoint layer.
pub trait Communicator: fmt::Debug + Send + Sync {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Blocks until every rank reaches the barrier.
    fn barrier(&self) -> TapeResult<()>;

    /// Gathers one value from every rank, ordered by rank.
    fn all_gather_u64(&self, value: u64) -> TapeResult<Vec<u64>>;

    /// Value of `root` on every rank.
    fn broadcast_u64(&self, value: u64, root: usize) -> TapeResult<u64>;

    /// Identifier of the communicator, identical on all ranks. Used in
    /// slow-tier file names.
    fn fingerprint(&self) -> u64;
}

/// Single-process communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> TapeResult<()> {
        Ok(())
    }

    fn all_gather_u64(&self, value: u64) -> TapeResult<Vec<u64>> {
        Ok(vec![value])
    }

    fn broadcast_u64(&self, value: u64, _root: usize) -> TapeResult<u64> {
        Ok(value)
    }

    fn fingerprint(&self) -> u64 {
        0
    }
}

/// FNV-1a digest, stable across processes and builds.
pub fn digest(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Checks that every rank holds the same `bytes`.
///
/// # Errors
///
/// [`TapeError::DesynchronizationDetected`] naming the first rank whose
/// digest differs from rank 0.
pub fn check_synchronized(comm: &dyn Communicator, what: &str, bytes: &[u8]) -> TapeResult<()> {
    let local = digest(bytes);
    let all = comm.all_gather_u64(local)?;
    if let Some(first) = all.first() {
        if let Some((rank, _)) = all.iter().enumerate().find(|(_, d)| *d != first) {
            return Err(TapeError::DesynchronizationDetected(format!(
                "{} differs between rank 0 and rank {}",
                what, rank
            )));
        }
    }
    Ok(())
}
