//! Snapshot tiers.
//!
//! - [`MemoryTier`]: fast tier, snapshots kept in memory
//! - [`DiskTier`]: slow tier, one file per snapshot and rank
//!
//! A snapshot is the list of copied initial conditions recorded at the
//! start of a block, keyed by [`VersionKey`]. Loading accepts a filter so
//! that only values the replay will actually read are materialised.
//!
//! # File layout
//!
//! Slow-tier files are named
//! `checkpoint_{manager}_{block}_{fingerprint}_{rank}.{bin|json}` and hold
//! the manager id, the block index and one record per value:
//! `{key, space, values}`. Function spaces are not serialised; they are
//! resolved through the in-process [`SpaceRegistry`] when a record is
//! materialised.

use crate::config::SnapshotFormat;
use crate::schedule::{Snapshot, SnapshotLoad, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tape_core::{
    check_synchronized, Communicator, Field, FunctionSpace, SpaceId, TapeError, TapeResult, VarId,
    VersionKey,
};

/// Contents of one snapshot.
pub type SnapshotEntries = Vec<(VersionKey, Field)>;

/// Storage for snapshots of one tier.
pub trait SnapshotTier: fmt::Debug + Send {
    /// Stores `entries` as the snapshot of `block`, replacing any previous one.
    fn save(&mut self, block: usize, entries: SnapshotEntries) -> TapeResult<()>;

    /// Reads the snapshot of `block`, keeping only ids accepted by `wanted`.
    fn load(
        &mut self,
        block: usize,
        delete: bool,
        wanted: &dyn Fn(VarId) -> bool,
    ) -> TapeResult<SnapshotEntries>;

    fn contains(&self, block: usize) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every snapshot.
    fn clear(&mut self) -> TapeResult<()>;
}

// ============================================================================
// Fast tier
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryTier {
    snapshots: HashMap<usize, SnapshotEntries>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotTier for MemoryTier {
    fn save(&mut self, block: usize, entries: SnapshotEntries) -> TapeResult<()> {
        self.snapshots.insert(block, entries);
        Ok(())
    }

    fn load(
        &mut self,
        block: usize,
        delete: bool,
        wanted: &dyn Fn(VarId) -> bool,
    ) -> TapeResult<SnapshotEntries> {
        let missing = || TapeError::missing(format!("no fast-tier snapshot for block {}", block));
        let entries = if delete {
            self.snapshots.remove(&block).ok_or_else(missing)?
        } else {
            self.snapshots.get(&block).cloned().ok_or_else(missing)?
        };
        Ok(entries.into_iter().filter(|(k, _)| wanted(k.id)).collect())
    }

    fn contains(&self, block: usize) -> bool {
        self.snapshots.contains_key(&block)
    }

    fn len(&self) -> usize {
        self.snapshots.len()
    }

    fn clear(&mut self) -> TapeResult<()> {
        self.snapshots.clear();
        Ok(())
    }
}

// ============================================================================
// Slow tier
// ============================================================================

/// Side table of function spaces seen in slow-tier snapshots.
#[derive(Debug, Default)]
pub struct SpaceRegistry {
    spaces: HashMap<SpaceId, Arc<FunctionSpace>>,
}

impl SpaceRegistry {
    pub fn register(&mut self, space: &Arc<FunctionSpace>) {
        self.spaces
            .entry(space.id())
            .or_insert_with(|| Arc::clone(space));
    }

    pub fn get(&self, id: SpaceId) -> TapeResult<Arc<FunctionSpace>> {
        self.spaces
            .get(&id)
            .cloned()
            .ok_or_else(|| TapeError::missing(format!("function space {} not registered", id)))
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    key: VersionKey,
    space: SpaceId,
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    manager: u64,
    block: usize,
    records: Vec<SnapshotRecord>,
}

impl SnapshotFormat {
    fn write(self, path: &Path, file: &SnapshotFile) -> TapeResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        match self {
            SnapshotFormat::Binary => bincode::serialize_into(&mut writer, file)
                .map_err(|e| TapeError::Serialization(e.to_string()))?,
            SnapshotFormat::Json => serde_json::to_writer(&mut writer, file)
                .map_err(|e| TapeError::Serialization(e.to_string()))?,
        }
        writer.flush()?;
        Ok(())
    }

    fn read(self, path: &Path) -> TapeResult<SnapshotFile> {
        let reader = BufReader::new(File::open(path)?);
        match self {
            SnapshotFormat::Binary => bincode::deserialize_from(reader)
                .map_err(|e| TapeError::Serialization(e.to_string())),
            SnapshotFormat::Json => serde_json::from_reader(reader)
                .map_err(|e| TapeError::Serialization(e.to_string())),
        }
    }
}

/// On-disk snapshots, one file per snapshot per rank.
#[derive(Debug)]
pub struct DiskTier {
    dir: PathBuf,
    format: SnapshotFormat,
    manager: u64,
    comm: Arc<dyn Communicator>,
    spaces: SpaceRegistry,
    blocks: BTreeSet<usize>,
}

impl DiskTier {
    /// Creates the tier, creating `dir` on rank 0.
    pub fn new(
        dir: impl Into<PathBuf>,
        format: SnapshotFormat,
        manager: u64,
        comm: Arc<dyn Communicator>,
    ) -> TapeResult<Self> {
        let dir = dir.into();
        if comm.rank() == 0 {
            fs::create_dir_all(&dir)?;
        }
        comm.barrier()?;
        Ok(Self {
            dir,
            format,
            manager,
            comm,
            spaces: SpaceRegistry::default(),
            blocks: BTreeSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }

    /// File holding this rank's snapshot of `block`.
    pub fn path(&self, block: usize) -> PathBuf {
        self.dir.join(format!(
            "checkpoint_{}_{}_{}_{}.{}",
            self.manager,
            block,
            self.comm.fingerprint(),
            self.comm.rank(),
            self.format.extension()
        ))
    }

    fn remove(&mut self, block: usize) -> TapeResult<()> {
        self.comm.barrier()?;
        fs::remove_file(self.path(block))?;
        self.blocks.remove(&block);
        Ok(())
    }
}

impl SnapshotTier for DiskTier {
    fn save(&mut self, block: usize, entries: SnapshotEntries) -> TapeResult<()> {
        let mut signature = Vec::with_capacity(8 + 16 * entries.len());
        signature.extend_from_slice(&(block as u64).to_le_bytes());
        for (key, _) in &entries {
            signature.extend_from_slice(&key.id.raw().to_le_bytes());
            signature.extend_from_slice(&key.version.to_le_bytes());
        }
        check_synchronized(self.comm.as_ref(), "slow-tier snapshot keys", &signature)?;

        let records = entries
            .into_iter()
            .map(|(key, value)| {
                self.spaces.register(value.space());
                SnapshotRecord {
                    key,
                    space: value.space().id(),
                    values: value.values().to_vec(),
                }
            })
            .collect();
        let file = SnapshotFile {
            manager: self.manager,
            block,
            records,
        };
        let path = self.path(block);
        self.format.write(&path, &file)?;
        tracing::debug!(block, path = %path.display(), "wrote slow-tier snapshot");
        self.blocks.insert(block);
        Ok(())
    }

    fn load(
        &mut self,
        block: usize,
        delete: bool,
        wanted: &dyn Fn(VarId) -> bool,
    ) -> TapeResult<SnapshotEntries> {
        if !self.blocks.contains(&block) {
            return Err(TapeError::missing(format!(
                "no slow-tier snapshot for block {}",
                block
            )));
        }
        let path = self.path(block);
        let file = self.format.read(&path)?;
        if file.manager != self.manager || file.block != block {
            return Err(TapeError::missing(format!(
                "{} holds block {} of manager {}, expected block {} of manager {}",
                path.display(),
                file.block,
                file.manager,
                block,
                self.manager
            )));
        }

        let mut entries = Vec::new();
        for record in file.records {
            if !wanted(record.key.id) {
                continue;
            }
            let space = self.spaces.get(record.space)?;
            entries.push((record.key, Field::from_values(&space, record.values)?));
        }

        if delete {
            self.remove(block)?;
        }
        Ok(entries)
    }

    fn contains(&self, block: usize) -> bool {
        self.blocks.contains(&block)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn clear(&mut self) -> TapeResult<()> {
        let blocks: Vec<usize> = self.blocks.iter().copied().collect();
        for block in blocks {
            self.remove(block)?;
        }
        Ok(())
    }
}

// ============================================================================
// Both tiers
// ============================================================================

/// The fast tier and an optional slow tier.
#[derive(Debug, Default)]
pub struct SnapshotTiers {
    fast: MemoryTier,
    slow: Option<DiskTier>,
}

impl SnapshotTiers {
    pub fn memory_only() -> Self {
        Self::default()
    }

    pub fn with_disk(slow: DiskTier) -> Self {
        Self {
            fast: MemoryTier::new(),
            slow: Some(slow),
        }
    }

    pub fn disk(&self) -> Option<&DiskTier> {
        self.slow.as_ref()
    }

    fn tier_mut(&mut self, tier: Tier) -> TapeResult<&mut dyn SnapshotTier> {
        match tier {
            Tier::Fast => Ok(&mut self.fast),
            Tier::Slow => self
                .slow
                .as_mut()
                .map(|d| d as &mut dyn SnapshotTier)
                .ok_or_else(|| TapeError::invalid_state("slow snapshot tier not configured")),
        }
    }

    pub fn save(&mut self, snapshot: Snapshot, entries: SnapshotEntries) -> TapeResult<()> {
        self.tier_mut(snapshot.tier)?.save(snapshot.block, entries)
    }

    pub fn load(
        &mut self,
        load: SnapshotLoad,
        wanted: &dyn Fn(VarId) -> bool,
    ) -> TapeResult<SnapshotEntries> {
        self.tier_mut(load.snapshot.tier)?
            .load(load.snapshot.block, load.delete, wanted)
    }

    /// Reads a snapshot without removing it.
    pub fn read(
        &mut self,
        snapshot: Snapshot,
        wanted: &dyn Fn(VarId) -> bool,
    ) -> TapeResult<SnapshotEntries> {
        self.load(
            SnapshotLoad {
                snapshot,
                delete: false,
            },
            wanted,
        )
    }

    /// Adds `entries` for ids not already held to an existing snapshot.
    ///
    /// Returns the number of entries added.
    pub fn extend(&mut self, snapshot: Snapshot, entries: SnapshotEntries) -> TapeResult<usize> {
        let mut held = self.read(snapshot, &|_| true)?;
        let ids: BTreeSet<VarId> = held.iter().map(|(k, _)| k.id).collect();
        let before = held.len();
        held.extend(entries.into_iter().filter(|(k, _)| !ids.contains(&k.id)));
        let added = held.len() - before;
        if added > 0 {
            held.sort_by_key(|(k, _)| *k);
            self.save(snapshot, held)?;
        }
        Ok(added)
    }

    pub fn contains(&self, snapshot: Snapshot) -> bool {
        match snapshot.tier {
            Tier::Fast => self.fast.contains(snapshot.block),
            Tier::Slow => self
                .slow
                .as_ref()
                .is_some_and(|d| d.contains(snapshot.block)),
        }
    }

    pub fn len(&self, tier: Tier) -> usize {
        match tier {
            Tier::Fast => self.fast.len(),
            Tier::Slow => self.slow.as_ref().map_or(0, |d| d.len()),
        }
    }

    /// Removes every snapshot from both tiers.
    pub fn clear(&mut self) -> TapeResult<()> {
        self.fast.clear()?;
        if let Some(slow) = self.slow.as_mut() {
            slow.clear()?;
        }
        Ok(())
    }
}
