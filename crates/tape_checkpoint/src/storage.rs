//! Checkpoint storage.
//!
//! Records the data the reverse sweep needs, keyed so that replayed values
//! can be matched exactly against the forward pass:
//!
//! - **initial conditions**: the first value of each variable seen within
//!   the current epoch (between [`CheckpointStorage::clear`] calls)
//! - **non-linear dependency data**: for each recorded equation, the values
//!   of its non-linear dependencies under their [`VersionKey`]s
//!
//! Checkpointable variables are stored as owned copies; all others as shared
//! references. References survive an epoch clear unless explicitly dropped.

use std::collections::{HashMap, HashSet};
use tape_core::{
    Equation, EquationKey, Field, TapeError, TapeResult, VarId, Variable, VersionKey,
};

/// A recorded value.
#[derive(Clone, Debug)]
pub enum StoredValue {
    /// Owned copy taken at record time.
    Copy(Field),
    /// Shared reference to the domain's value.
    Reference(Field),
}

impl StoredValue {
    fn record(x: &Variable, value: &Field) -> Self {
        if x.is_checkpointable() {
            StoredValue::Copy(value.deep_copy())
        } else {
            StoredValue::Reference(value.clone())
        }
    }

    pub fn value(&self) -> &Field {
        match self {
            StoredValue::Copy(v) | StoredValue::Reference(v) => v,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, StoredValue::Reference(_))
    }
}

/// What [`CheckpointStorage::clear`] discards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClearScope {
    /// Copied initial conditions and the seen set
    pub initial_conditions: bool,
    /// Version counters, dependency keys and non-linear data
    pub data: bool,
    /// Retained references
    pub references: bool,
}

impl ClearScope {
    /// Start of a new epoch: references are kept.
    pub const EPOCH: Self = Self {
        initial_conditions: true,
        data: true,
        references: false,
    };

    /// Non-linear data only.
    pub const DATA: Self = Self {
        initial_conditions: false,
        data: true,
        references: false,
    };

    /// Everything.
    pub const ALL: Self = Self {
        initial_conditions: true,
        data: true,
        references: true,
    };
}

/// Store of initial conditions and non-linear dependency data.
#[derive(Clone, Debug, Default)]
pub struct CheckpointStorage {
    store_ics: bool,
    store_data: bool,
    seen_ics: HashSet<VarId>,
    ics: HashMap<VarId, (u64, Field)>,
    refs: HashMap<VarId, Field>,
    indices: HashMap<VarId, u64>,
    dep_keys: HashMap<EquationKey, Vec<VersionKey>>,
    data: HashMap<VersionKey, StoredValue>,
}

impl CheckpointStorage {
    /// Creates a store recording both initial conditions and data.
    pub fn new() -> Self {
        Self {
            store_ics: true,
            store_data: true,
            ..Self::default()
        }
    }

    pub fn configure(&mut self, store_ics: bool, store_data: bool) {
        self.store_ics = store_ics;
        self.store_data = store_data;
    }

    #[inline]
    pub fn store_ics(&self) -> bool {
        self.store_ics
    }

    #[inline]
    pub fn store_data(&self) -> bool {
        self.store_data
    }

    fn data_key(&self, id: VarId) -> VersionKey {
        VersionKey::new(id, self.indices.get(&id).copied().unwrap_or(0))
    }

    /// Discards the parts named by `scope`.
    ///
    /// Retained references are marked seen again and re-registered as data
    /// under their current version key.
    pub fn clear(&mut self, scope: ClearScope) {
        if scope.initial_conditions {
            self.seen_ics.clear();
            self.ics.clear();
        }
        if scope.data {
            self.indices.clear();
            self.dep_keys.clear();
            self.data.clear();
        }
        if scope.references {
            self.refs.clear();
        } else {
            let refs: Vec<(VarId, Field)> =
                self.refs.iter().map(|(id, v)| (*id, v.clone())).collect();
            for (id, value) in refs {
                self.seen_ics.insert(id);
                let key = self.data_key(id);
                self.data.insert(key, StoredValue::Reference(value));
            }
        }
    }

    /// Records the first-seen value of `x` in this epoch.
    ///
    /// No-op when initial conditions are not being stored or `x` was already
    /// seen. `copy` defaults to `x.is_checkpointable()`.
    pub fn add_initial_condition(&mut self, x: &Variable, value: &Field, copy: Option<bool>) {
        if !self.store_ics || self.seen_ics.contains(&x.id()) {
            return;
        }
        if copy.unwrap_or_else(|| x.is_checkpointable()) {
            let version = self.data_key(x.id()).version;
            self.ics.insert(x.id(), (version, value.deep_copy()));
        } else {
            self.refs.insert(x.id(), value.clone());
        }
        self.seen_ics.insert(x.id());
    }

    /// Records equation `eq` at `key` with its post-solve dependency values.
    ///
    /// Output versions are incremented first, so non-linear data recorded for
    /// an output refers to the value just computed.
    pub fn add_equation(
        &mut self,
        key: EquationKey,
        eq: &dyn Equation,
        deps: &[Field],
    ) -> TapeResult<()> {
        let eq_deps = eq.dependencies();
        if eq_deps.len() != deps.len() {
            return Err(TapeError::InvariantViolation(format!(
                "{} ({}) has {} dependencies but {} values were supplied",
                key,
                eq.name(),
                eq_deps.len(),
                deps.len()
            )));
        }

        for x in eq.outputs() {
            *self.indices.entry(x.id()).or_insert(0) += 1;
        }

        if self.store_ics {
            for x in eq.outputs() {
                self.seen_ics.insert(x.id());
            }
            for (dep, value) in eq_deps.iter().zip(deps) {
                self.add_initial_condition(dep, value, None);
            }
        }

        if self.store_data {
            let mut keys = Vec::with_capacity(eq.nonlinear_dependency_indices().len());
            for &i in eq.nonlinear_dependency_indices() {
                let dep = &eq_deps[i];
                let data_key = self.data_key(dep.id());
                if !self.data.contains_key(&data_key) {
                    self.data
                        .insert(data_key, StoredValue::record(dep, &deps[i]));
                }
                keys.push(data_key);
            }
            self.dep_keys.insert(key, keys);
        }
        Ok(())
    }

    /// Non-linear dependency values recorded for `key`.
    ///
    /// # Errors
    ///
    /// [`TapeError::MissingData`] if no data was recorded for `key`.
    pub fn lookup(&self, key: EquationKey) -> TapeResult<Vec<Field>> {
        let keys = self
            .dep_keys
            .get(&key)
            .ok_or_else(|| TapeError::missing(format!("no data recorded for {}", key)))?;
        keys.iter()
            .map(|k| {
                self.data.get(k).map(|v| v.value().clone()).ok_or_else(|| {
                    TapeError::missing(format!("value {} for {} not stored", k, key))
                })
            })
            .collect()
    }

    /// Whether non-linear data is held for `key`.
    pub fn contains(&self, key: EquationKey) -> bool {
        self.dep_keys.contains_key(&key)
    }

    /// The recorded initial condition of `x`.
    pub fn initial_condition(&self, x: VarId) -> TapeResult<Field> {
        self.ics
            .get(&x)
            .map(|(_, v)| v.clone())
            .or_else(|| self.refs.get(&x).cloned())
            .ok_or_else(|| TapeError::missing(format!("initial condition for {} not stored", x)))
    }

    /// Recorded initial conditions, copied and/or referenced.
    pub fn initial_conditions(&self, copied: bool, referenced: bool) -> HashMap<VarId, Field> {
        let mut out = HashMap::new();
        if copied {
            out.extend(self.ics.iter().map(|(id, (_, v))| (*id, v.clone())));
        }
        if referenced {
            out.extend(self.refs.iter().map(|(id, v)| (*id, v.clone())));
        }
        out
    }

    /// Copied initial conditions with their version keys, ordered by id.
    ///
    /// These are the contents of a snapshot.
    pub fn snapshot_entries(&self) -> Vec<(VersionKey, Field)> {
        let mut entries: Vec<(VersionKey, Field)> = self
            .ics
            .iter()
            .map(|(id, (version, v))| (VersionKey::new(*id, *version), v.clone()))
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }

    pub fn initial_condition_count(&self) -> usize {
        self.ics.len()
    }

    pub fn reference_count(&self) -> usize {
        self.refs.len()
    }

    pub fn equation_count(&self) -> usize {
        self.dep_keys.len()
    }

    pub fn data_count(&self) -> usize {
        self.data.len()
    }
}
