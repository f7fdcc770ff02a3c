//! The equation manager.
//!
//! [`EquationManager`] is the entry point of the crate. It records
//! equations into blocks while annotation is enabled, asks the snapshot
//! schedule to checkpoint every block boundary, and runs the reverse sweep
//! in [`EquationManager::compute_gradient`].
//!
//! # State
//!
//! Annotation moves `Initial → Annotating ⇄ Stopped* → Final`; the
//! tangent-linear axis moves `Initial → Deriving ⇄ Stopped* → Final`.
//! `Final` is terminal on both and is entered by [`EquationManager::finalize`].
//!
//! # Tangent-linear models
//!
//! While derivation is enabled, [`EquationManager::solve`] asks every
//! registered model for the tangent-linear equation of each solved equation
//! that reads a control or an already computed tangent, then solves the
//! derived equations after the primal one. Derived equations are recorded
//! like any other, so the adjoint of a tangent is available from the same
//! tape. Only first-order models are derived.
//!
//! # Reverse sweep
//!
//! The recorded blocks are framed by a controls pseudo-block in front and a
//! functionals pseudo-block at the end (see [`crate::markers`]). Blocks are
//! visited last to first; the schedule restores the non-linear data of each
//! recorded block before its equations are reversed. Equations with no
//! pending right-hand side are pruned without calling their adjoint.

use crate::markers::{ControlsMarker, FunctionalMarker};
use crate::rhs::AdjointRhs;
use crate::tape::{ReplayStats, Tape, TapeDriver};
use crate::transpose::{DependencyTransposer, Use};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tape_checkpoint::schedule::MemorySchedule;
use tape_checkpoint::{
    CheckpointConfig, CheckpointMode, CheckpointSchedule, CheckpointStorage, DiskTier,
    SnapshotTiers, Tier,
};
use tape_core::{
    Communicator, Equation, EquationId, EquationKey, Field, SelfComm, TangentLinearMap, TapeError,
    TapeResult, VarId, Variable, Workspace,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(0);

/// A registered tangent-linear model and the tangents derived so far.
#[derive(Debug)]
struct TangentLinearModel {
    m: Vec<Variable>,
    dm: Vec<Variable>,
    map: TangentLinearMap,
}

impl TangentLinearModel {
    fn is(&self, m: &[Variable], dm: &[Variable]) -> bool {
        self.m == m && self.dm == dm
    }

    /// Whether `eq` reads a control or a variable that has a tangent.
    fn touches(&self, eq: &dyn Equation) -> bool {
        eq.dependencies()
            .iter()
            .any(|dep| self.m.contains(dep) || self.map.contains(dep))
    }
}

/// Annotation axis of the manager state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationState {
    Initial,
    Annotating,
    StoppedInitial,
    StoppedAnnotating,
    Final,
}

impl AnnotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationState::Initial => "initial",
            AnnotationState::Annotating => "annotating",
            AnnotationState::StoppedInitial => "stopped_initial",
            AnnotationState::StoppedAnnotating => "stopped_annotating",
            AnnotationState::Final => "final",
        }
    }
}

impl fmt::Display for AnnotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tangent-linear axis of the manager state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlmState {
    Initial,
    Deriving,
    StoppedInitial,
    StoppedDeriving,
    Final,
}

impl TlmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlmState::Initial => "initial",
            TlmState::Deriving => "deriving",
            TlmState::StoppedInitial => "stopped_initial",
            TlmState::StoppedDeriving => "stopped_deriving",
            TlmState::Final => "final",
        }
    }
}

impl fmt::Display for TlmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One equation visited by the reverse sweep, for one requested output.
#[derive(Debug)]
pub struct AdjointEvent<'a> {
    /// Index of the output (functional) in the request
    pub output: usize,
    pub block: usize,
    /// Position within the block
    pub equation: usize,
    pub id: EquationId,
    pub name: &'static str,
    /// Adjoint solution, `None` if the equation was pruned
    pub adj_x: Option<&'a [Field]>,
    /// Non-linear dependency values the adjoint was evaluated at
    pub nl_deps: &'a [Field],
}

/// Status report returned by [`EquationManager::info`].
#[derive(Clone, Debug, Serialize)]
pub struct ManagerInfo {
    pub manager: u64,
    pub annotation: AnnotationState,
    pub tlm: TlmState,
    pub mode: CheckpointMode,
    pub blocks: usize,
    pub equations: usize,
    pub store_ics: bool,
    pub store_data: bool,
    pub initial_conditions_stored: usize,
    pub initial_conditions_referenced: usize,
    pub equations_with_data: usize,
    pub fast_snapshots: usize,
    pub slow_snapshots: usize,
    pub tangent_linear_models: usize,
    pub stats: ReplayStats,
}

fn build_tiers(
    config: &CheckpointConfig,
    manager: u64,
    comm: &Arc<dyn Communicator>,
) -> TapeResult<SnapshotTiers> {
    if !config.uses_slow_tier() {
        return Ok(SnapshotTiers::memory_only());
    }
    let disk = DiskTier::new(
        config.tier_path.clone(),
        config.format,
        manager,
        Arc::clone(comm),
    )?;
    Ok(SnapshotTiers::with_disk(disk))
}

/// Structural rules every recorded equation must satisfy.
fn validate_equation(eq: &dyn Equation) -> TapeResult<()> {
    let outputs = eq.outputs();
    let deps = eq.dependencies();
    let invalid = |message: String| Err(TapeError::InvalidParameter(message));

    if outputs.is_empty() {
        return invalid(format!("{} has no outputs", eq.name()));
    }
    if deps.len() < outputs.len() || deps[..outputs.len()] != *outputs {
        return invalid(format!(
            "{} must list its outputs first among its dependencies",
            eq.name()
        ));
    }
    for (i, x) in outputs.iter().enumerate() {
        if outputs[..i].contains(x) {
            return invalid(format!("{} writes {} twice", eq.name(), x));
        }
        if deps[outputs.len()..].contains(x) {
            return invalid(format!(
                "{} output {} also appears as a dependency",
                eq.name(),
                x
            ));
        }
    }
    if let Some(&i) = eq
        .nonlinear_dependency_indices()
        .iter()
        .find(|&&i| i >= deps.len())
    {
        return invalid(format!(
            "{} non-linear dependency index {} out of range",
            eq.name(),
            i
        ));
    }
    Ok(())
}

/// Records equations and computes derivatives by a checkpointed reverse
/// sweep.
///
/// Managers are explicit values: each owns its tape, checkpoint storage,
/// schedule and snapshot tiers. [`fork`](Self::fork) creates an independent
/// manager sharing the communicator.
#[derive(Debug)]
pub struct EquationManager {
    id: u64,
    comm: Arc<dyn Communicator>,
    config: CheckpointConfig,
    annotation: AnnotationState,
    tlm: TlmState,
    tlm_models: Vec<TangentLinearModel>,
    tape: Tape,
    cp: CheckpointStorage,
    schedule: Box<dyn CheckpointSchedule>,
    tiers: SnapshotTiers,
    stats: ReplayStats,
    replace_map: HashMap<VarId, Variable>,
    released: HashSet<EquationId>,
}

impl Default for EquationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EquationManager {
    /// Single-process manager keeping everything in memory.
    pub fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            comm: Arc::new(SelfComm),
            config: CheckpointConfig::memory(),
            annotation: AnnotationState::Initial,
            tlm: TlmState::Initial,
            tlm_models: Vec::new(),
            tape: Tape::new(),
            // Records initial conditions and data, as the memory schedule asks.
            cp: CheckpointStorage::new(),
            schedule: Box::new(MemorySchedule::new()),
            tiers: SnapshotTiers::memory_only(),
            stats: ReplayStats::default(),
            replace_map: HashMap::new(),
            released: HashSet::new(),
        }
    }

    /// Single-process manager using `config`.
    pub fn with_config(config: CheckpointConfig) -> TapeResult<Self> {
        Self::with_comm(Arc::new(SelfComm), config)
    }

    /// Manager on `comm` using `config`. The manager id is taken on rank 0
    /// and broadcast.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`CheckpointConfig::validate`], and I/O
    /// errors creating the slow-tier directory.
    pub fn with_comm(comm: Arc<dyn Communicator>, config: CheckpointConfig) -> TapeResult<Self> {
        config.validate()?;
        let local = if comm.rank() == 0 {
            NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        let id = comm.broadcast_u64(local, 0)?;
        let tiers = build_tiers(&config, id, &comm)?;
        let schedule = config.build_schedule()?;

        let mut manager = Self {
            id,
            comm,
            config,
            annotation: AnnotationState::Initial,
            tlm: TlmState::Initial,
            tlm_models: Vec::new(),
            tape: Tape::new(),
            cp: CheckpointStorage::new(),
            schedule,
            tiers,
            stats: ReplayStats::default(),
            replace_map: HashMap::new(),
            released: HashSet::new(),
        };
        manager.start_schedule()?;
        tracing::debug!(
            manager = manager.id,
            mode = %manager.config.mode,
            "equation manager created"
        );
        Ok(manager)
    }

    /// Independent manager on the same communicator, with `config` or a copy
    /// of this manager's configuration.
    pub fn fork(&self, config: Option<CheckpointConfig>) -> TapeResult<Self> {
        Self::with_comm(
            Arc::clone(&self.comm),
            config.unwrap_or_else(|| self.config.clone()),
        )
    }

    fn start_schedule(&mut self) -> TapeResult<()> {
        let mut driver = TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
        self.schedule.start(&mut driver)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn annotation_state(&self) -> AnnotationState {
        self.annotation
    }

    pub fn tlm_state(&self) -> TlmState {
        self.tlm
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn schedule(&self) -> &dyn CheckpointSchedule {
        self.schedule.as_ref()
    }

    pub fn tiers(&self) -> &SnapshotTiers {
        &self.tiers
    }

    // ========================================================================
    // Configuration and state
    // ========================================================================

    /// Replaces the checkpointing configuration.
    ///
    /// # Errors
    ///
    /// [`TapeError::InvalidState`] once annotation has begun; configuration
    /// errors otherwise.
    pub fn configure_checkpointing(&mut self, config: CheckpointConfig) -> TapeResult<()> {
        let fresh = matches!(
            self.annotation,
            AnnotationState::Initial | AnnotationState::StoppedInitial
        ) && self.tape.is_empty();
        if !fresh {
            return Err(TapeError::invalid_state(
                "cannot configure checkpointing after annotation has begun",
            ));
        }
        config.validate()?;
        let tiers = build_tiers(&config, self.id, &self.comm)?;
        let schedule = config.build_schedule()?;

        self.tiers.clear()?;
        self.tiers = tiers;
        self.schedule = schedule;
        self.config = config;
        self.cp = CheckpointStorage::new();
        self.stats = ReplayStats::default();
        self.start_schedule()
    }

    /// Discards the tape and all checkpoint data, keeping the configuration.
    pub fn reset(&mut self) -> TapeResult<()> {
        self.reset_with(self.config.clone())
    }

    /// Discards the tape and all checkpoint data and switches to `config`.
    pub fn reset_with(&mut self, config: CheckpointConfig) -> TapeResult<()> {
        config.validate()?;
        self.tiers.clear()?;
        self.tiers = build_tiers(&config, self.id, &self.comm)?;
        self.schedule = config.build_schedule()?;
        self.config = config;

        self.annotation = AnnotationState::Initial;
        self.tlm = TlmState::Initial;
        self.tlm_models.clear();
        self.tape = Tape::new();
        self.cp = CheckpointStorage::new();
        self.stats = ReplayStats::default();
        self.replace_map.clear();
        self.released.clear();
        self.start_schedule()?;
        tracing::debug!(manager = self.id, mode = %self.config.mode, "equation manager reset");
        Ok(())
    }

    pub fn annotation_enabled(&self) -> bool {
        matches!(
            self.annotation,
            AnnotationState::Initial | AnnotationState::Annotating
        )
    }

    pub fn tlm_enabled(&self) -> bool {
        self.tlm == TlmState::Deriving
    }

    fn enablement(&self) -> (bool, bool) {
        (
            self.annotation_enabled(),
            matches!(self.tlm, TlmState::Initial | TlmState::Deriving),
        )
    }

    /// Resumes annotation and/or tangent-linear derivation. Returns the
    /// previous `(annotation, tlm)` enablement.
    pub fn start(&mut self, annotation: bool, tlm: bool) -> (bool, bool) {
        let previous = self.enablement();
        if annotation {
            self.annotation = match self.annotation {
                AnnotationState::StoppedInitial => AnnotationState::Initial,
                AnnotationState::StoppedAnnotating => AnnotationState::Annotating,
                state => state,
            };
        }
        if tlm {
            self.tlm = match self.tlm {
                TlmState::StoppedInitial => TlmState::Initial,
                TlmState::StoppedDeriving => TlmState::Deriving,
                state => state,
            };
        }
        previous
    }

    /// Pauses annotation and/or tangent-linear derivation. Returns the
    /// previous `(annotation, tlm)` enablement.
    pub fn stop(&mut self, annotation: bool, tlm: bool) -> (bool, bool) {
        let previous = self.enablement();
        if annotation {
            self.annotation = match self.annotation {
                AnnotationState::Initial => AnnotationState::StoppedInitial,
                AnnotationState::Annotating => AnnotationState::StoppedAnnotating,
                state => state,
            };
        }
        if tlm {
            self.tlm = match self.tlm {
                TlmState::Initial => TlmState::StoppedInitial,
                TlmState::Deriving => TlmState::StoppedDeriving,
                state => state,
            };
        }
        previous
    }

    /// Registers a tangent-linear model for controls `m` in direction `dm`.
    pub fn add_tlm(&mut self, m: &[Variable], dm: &[Variable]) -> TapeResult<()> {
        if self.tlm == TlmState::Final {
            return Err(TapeError::invalid_state(
                "cannot add a tangent-linear model after finalisation",
            ));
        }
        if m.is_empty() || m.len() != dm.len() {
            return Err(TapeError::InvalidParameter(format!(
                "tangent-linear model needs one direction per control ({} controls, {} directions)",
                m.len(),
                dm.len()
            )));
        }
        for (mi, dmi) in m.iter().zip(dm) {
            if mi.space().dim() != dmi.space().dim() {
                return Err(TapeError::DimensionMismatch {
                    expected: mi.space().dim(),
                    got: dmi.space().dim(),
                });
            }
        }
        if self.tlm_models.iter().any(|model| model.is(m, dm)) {
            return Err(TapeError::InvalidParameter(
                "duplicate tangent-linear model".to_string(),
            ));
        }
        self.tlm = match self.tlm {
            TlmState::Initial => TlmState::Deriving,
            TlmState::StoppedInitial => TlmState::StoppedDeriving,
            state => state,
        };
        self.tlm_models.push(TangentLinearModel {
            m: m.to_vec(),
            dm: dm.to_vec(),
            map: TangentLinearMap::for_model(m, dm),
        });
        tracing::debug!(
            manager = self.id,
            controls = m.len(),
            n_models = self.tlm_models.len(),
            "registered tangent-linear model"
        );
        Ok(())
    }

    /// The tangent of `x` in the model for controls `m` and directions `dm`.
    ///
    /// # Errors
    ///
    /// [`TapeError::MissingData`] if no such model is registered or no
    /// equation writing a tangent of `x` has been solved.
    pub fn tlm(&self, m: &[Variable], dm: &[Variable], x: &Variable) -> TapeResult<Variable> {
        let model = self
            .tlm_models
            .iter()
            .find(|model| model.is(m, dm))
            .ok_or_else(|| TapeError::missing("no such tangent-linear model"))?;
        model
            .map
            .get(x)
            .cloned()
            .ok_or_else(|| TapeError::missing(format!("no tangent-linear variable for {}", x)))
    }

    /// The tangent-linear equations of `eq`, one per model it touches.
    fn derive_tangents(&mut self, eq: &dyn Equation) -> TapeResult<Vec<Box<dyn Equation>>> {
        let mut derived = Vec::new();
        for model in &mut self.tlm_models {
            if !model.touches(eq) {
                continue;
            }
            if let Some(x) = eq.outputs().iter().find(|x| model.m.contains(x)) {
                return Err(TapeError::InvalidParameter(format!(
                    "invalid tangent-linear parameter: control {} is written by {}",
                    x,
                    eq.name()
                )));
            }
            derived.push(eq.tangent_linear(&model.m, &model.dm, &mut model.map)?);
        }
        Ok(derived)
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Returns `Ok(true)` if a recording call should proceed.
    fn begin_recording(&mut self, what: &str) -> TapeResult<bool> {
        match self.annotation {
            AnnotationState::Final => Err(TapeError::InvalidState(format!(
                "cannot add {} after finalisation",
                what
            ))),
            AnnotationState::StoppedInitial | AnnotationState::StoppedAnnotating => Ok(false),
            AnnotationState::Initial => {
                self.annotation = AnnotationState::Annotating;
                Ok(true)
            }
            AnnotationState::Annotating => Ok(true),
        }
    }

    /// Records the current value of `x` as an initial condition.
    pub fn add_initial_condition(&mut self, x: &Variable, ws: &Workspace) -> TapeResult<()> {
        let value = ws.get(x)?;
        if self.begin_recording("initial conditions")? {
            self.cp.add_initial_condition(x, value, None);
        }
        Ok(())
    }

    /// Appends an already solved equation to the current block.
    ///
    /// Dependency values (outputs included) are read from `ws`. Ignored
    /// while annotation is stopped. No tangent-linear equations are derived:
    /// the caller has already computed the outputs.
    ///
    /// # Errors
    ///
    /// [`TapeError::InvalidState`] after finalisation,
    /// [`TapeError::InvalidParameter`] for a malformed equation, and
    /// [`TapeError::Equation`] if a dependency has no value.
    pub fn add_equation(&mut self, eq: Box<dyn Equation>, ws: &Workspace) -> TapeResult<()> {
        validate_equation(eq.as_ref())?;
        let values = eq
            .dependencies()
            .iter()
            .map(|dep| ws.get(dep).cloned())
            .collect::<TapeResult<Vec<Field>>>()?;
        if !self.begin_recording("equations")? {
            return Ok(());
        }

        let key = self.tape.next_key();
        self.cp.add_equation(key, eq.as_ref(), &values)?;
        tracing::trace!(manager = self.id, %key, equation = eq.name(), "recorded equation");
        self.tape.push(eq);
        Ok(())
    }

    /// Solves `eq` against `ws` and records it if annotation is enabled.
    ///
    /// For equations with an initial condition the previous output values
    /// are recorded before the solve. While tangent-linear derivation is
    /// enabled, the derived equations are solved (and recorded) after `eq`.
    ///
    /// # Errors
    ///
    /// [`TapeError::InvalidParameter`] if `eq` writes a control of a
    /// tangent-linear model, or [`TapeError::Equation`] if it has no
    /// tangent-linear equation; in both cases nothing is solved.
    pub fn solve(&mut self, eq: Box<dyn Equation>, ws: &mut Workspace) -> TapeResult<()> {
        validate_equation(eq.as_ref())?;
        let tangents = if self.tlm_enabled() {
            self.derive_tangents(eq.as_ref())?
        } else {
            Vec::new()
        };
        self.solve_one(eq, ws)?;
        for tangent in tangents {
            self.solve_one(tangent, ws)?;
        }
        Ok(())
    }

    fn solve_one(&mut self, eq: Box<dyn Equation>, ws: &mut Workspace) -> TapeResult<()> {
        let n_outputs = eq.outputs().len();
        let values = eq
            .dependencies()
            .iter()
            .enumerate()
            .map(|(i, dep)| {
                if i < n_outputs {
                    Ok(ws.get_or_zero(dep))
                } else {
                    ws.get(dep).cloned()
                }
            })
            .collect::<TapeResult<Vec<Field>>>()?;

        let annotate = self.annotation_enabled();
        if annotate && eq.has_initial_condition() && self.begin_recording("initial conditions")? {
            for (x, value) in eq.outputs().iter().zip(&values) {
                self.cp.add_initial_condition(x, value, None);
            }
        }

        let outputs = eq.forward_solve(&values)?;
        if outputs.len() != n_outputs {
            return Err(TapeError::Equation(format!(
                "{} returned {} values for {} outputs",
                eq.name(),
                outputs.len(),
                n_outputs
            )));
        }
        for (x, value) in eq.outputs().iter().zip(outputs) {
            ws.set(x, value)?;
        }

        if annotate {
            self.add_equation(eq, ws)?;
        }
        Ok(())
    }

    /// Swaps the dependencies of a recorded equation for placeholders, so
    /// that the domain may drop the underlying objects.
    pub fn release(&mut self, eq_id: EquationId) -> TapeResult<()> {
        if self.released.contains(&eq_id) {
            return Ok(());
        }
        let eq = self
            .tape
            .get_mut(eq_id)
            .ok_or_else(|| TapeError::missing(format!("equation {} is not on the tape", eq_id)))?;
        let mut mapping = HashMap::with_capacity(eq.dependencies().len());
        for dep in eq.dependencies() {
            let placeholder = self
                .replace_map
                .entry(dep.id())
                .or_insert_with(|| dep.placeholder())
                .clone();
            mapping.insert(dep.id(), placeholder);
        }
        eq.replace(&mapping);
        self.released.insert(eq_id);
        Ok(())
    }

    /// The placeholder standing in for `x`, or `x` itself.
    pub fn map(&self, x: &Variable) -> Variable {
        self.replace_map
            .get(&x.id())
            .cloned()
            .unwrap_or_else(|| x.clone())
    }

    /// Closes the current block and checkpoints the boundary.
    ///
    /// Ignored while annotation is stopped or final, and when the schedule
    /// is already in its last block (the caller must
    /// [`finalize`](Self::finalize)).
    pub fn new_block(&mut self) -> TapeResult<()> {
        if !self.annotation_enabled() {
            return Ok(());
        }
        let n_blocks = self.tape.n_blocks();
        if self.schedule.is_final_block(n_blocks) {
            tracing::warn!(
                manager = self.id,
                block = n_blocks,
                "attempting to end the final block without finalising; ignored"
            );
            return Ok(());
        }

        self.tape.close_block();
        let mut driver = TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
        self.schedule.checkpoint(n_blocks + 1, false, &mut driver)
    }

    /// Closes the last block and ends annotation. Idempotent.
    pub fn finalize(&mut self) -> TapeResult<()> {
        if self.annotation == AnnotationState::Final {
            return Ok(());
        }
        self.tape.close_block();
        let n_blocks = self.tape.n_blocks();
        let mut driver = TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
        if let Err(err) = self.schedule.checkpoint(n_blocks, true, &mut driver) {
            self.tape.reopen_block();
            return Err(err);
        }
        self.annotation = AnnotationState::Final;
        self.tlm = TlmState::Final;
        tracing::debug!(
            manager = self.id,
            blocks = n_blocks,
            equations = self.tape.equation_count(),
            "tape finalised"
        );
        Ok(())
    }

    // ========================================================================
    // Reverse sweep
    // ========================================================================

    /// Derivatives of each output with respect to each control.
    ///
    /// Finalises the manager. Returns one vector per output holding one
    /// field per control; controls the output does not depend on get zero.
    pub fn compute_gradient(
        &mut self,
        outputs: &[Variable],
        controls: &[Variable],
    ) -> TapeResult<Vec<Vec<Field>>> {
        self.compute_gradient_with(outputs, controls, |_| {})
    }

    /// As [`compute_gradient`](Self::compute_gradient), reporting every
    /// recorded equation visited to `callback`.
    ///
    /// # Errors
    ///
    /// Any error of the schedule, the storage or an equation aborts the
    /// sweep. [`TapeError::InvariantViolation`] if right-hand sides or
    /// routes are left over at the end.
    pub fn compute_gradient_with<F>(
        &mut self,
        outputs: &[Variable],
        controls: &[Variable],
        mut callback: F,
    ) -> TapeResult<Vec<Vec<Field>>>
    where
        F: FnMut(&AdjointEvent<'_>),
    {
        self.finalize()?;
        if self.schedule.r() > 0 {
            let mut driver =
                TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
            self.schedule.rewind(&mut driver)?;
        }

        let controls_marker = ControlsMarker::new(controls)?;
        let functional_markers = outputs
            .iter()
            .map(FunctionalMarker::new)
            .collect::<TapeResult<Vec<_>>>()?;

        let n_recorded = self.tape.n_blocks();
        let mut blocks: Vec<Vec<&dyn Equation>> = Vec::with_capacity(n_recorded + 2);
        blocks.push(vec![&controls_marker as &dyn Equation]);
        for b in 0..n_recorded {
            blocks.push(self.tape.block(b).collect());
        }
        blocks.push(
            functional_markers
                .iter()
                .map(|m| m as &dyn Equation)
                .collect(),
        );

        let mut transposer = DependencyTransposer::new(&blocks, controls);
        let last = blocks.len() - 1;
        let mut rhs: Vec<AdjointRhs> = Vec::with_capacity(outputs.len());
        for (o, marker) in functional_markers.iter().enumerate() {
            let mut b = AdjointRhs::new();
            b.seed(last, o, 0, marker.seed())?;
            rhs.push(b);
        }

        let mut derivatives: Vec<Option<Vec<Field>>> = vec![None; outputs.len()];
        for (j, block) in blocks.iter().enumerate().rev() {
            let recorded = (1..=n_recorded).contains(&j);
            if recorded {
                let mut driver =
                    TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
                self.schedule.restore(j - 1, &mut driver)?;
            }

            for (k, &eq) in block.iter().enumerate().rev() {
                let nl_deps = if recorded {
                    self.cp.lookup(EquationKey::new(j - 1, k))?
                } else {
                    Vec::new()
                };

                let routes: Vec<(usize, Use)> = eq
                    .dependencies()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, dep)| {
                        transposer
                            .get(dep.id())
                            .filter(|u| !u.is_from(j, k))
                            .map(|u| (i, u))
                    })
                    .collect();
                transposer.pop();

                for (o, b) in rhs.iter_mut().enumerate() {
                    let adj_x = match b.take(j, k, eq.outputs()) {
                        Some(eq_rhs) => eq.adjoint(&nl_deps, &eq_rhs)?,
                        None => None,
                    };

                    if let Some(adj_x) = &adj_x {
                        if adj_x.len() != eq.outputs().len() {
                            return Err(TapeError::Equation(format!(
                                "{} adjoint returned {} values for {} outputs",
                                eq.name(),
                                adj_x.len(),
                                eq.outputs().len()
                            )));
                        }
                        for &(i, target) in &routes {
                            if let Some(contribution) = eq.partial_route(i, &nl_deps, adj_x)? {
                                b.add(target, contribution)?;
                            }
                        }
                    }

                    if recorded {
                        callback(&AdjointEvent {
                            output: o,
                            block: j - 1,
                            equation: k,
                            id: eq.id(),
                            name: eq.name(),
                            adj_x: adj_x.as_deref(),
                            nl_deps: &nl_deps,
                        });
                    }
                    if j == 0 {
                        derivatives[o] = Some(adj_x.unwrap_or_else(|| {
                            controls.iter().map(|m| Field::zeros(m.space())).collect()
                        }));
                    }
                }
            }
        }

        if let Some(left) = rhs.iter().find(|b| !b.is_empty()) {
            return Err(TapeError::InvariantViolation(format!(
                "{} adjoint right-hand sides left after the reverse sweep",
                left.len()
            )));
        }
        if !transposer.is_empty() {
            return Err(TapeError::InvariantViolation(format!(
                "{} equations left in the dependency transposer",
                transposer.remaining()
            )));
        }

        let mut driver = TapeDriver::new(&self.tape, &mut self.cp, &mut self.tiers, &mut self.stats);
        self.schedule.finish_reverse(&mut driver)?;
        self.stats.reverse_sweeps += 1;
        tracing::debug!(
            manager = self.id,
            outputs = outputs.len(),
            controls = controls.len(),
            replayed_blocks = self.stats.replayed_blocks,
            "reverse sweep complete"
        );

        Ok(derivatives
            .into_iter()
            .map(|d| {
                d.unwrap_or_else(|| controls.iter().map(|m| Field::zeros(m.space())).collect())
            })
            .collect())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Value of `x` recorded at the start of block 0. Finalises the manager.
    ///
    /// # Errors
    ///
    /// [`TapeError::MissingData`] if `x` is not a dependency of block 0 or
    /// has no recorded initial condition.
    pub fn initial_condition(&mut self, x: &Variable) -> TapeResult<Field> {
        self.finalize()?;
        if !self
            .tape
            .block(0)
            .any(|eq| eq.dependencies().contains(x))
        {
            return Err(TapeError::missing(format!(
                "{} is not a dependency of block 0",
                x
            )));
        }

        if let Some(snapshot) = self.schedule.initial_snapshot() {
            if self.tiers.contains(snapshot) {
                let id = x.id();
                let entries = self.tiers.read(snapshot, &|v| v == id)?;
                if let Some((_, value)) = entries.into_iter().next() {
                    return Ok(value);
                }
            }
        }
        self.cp.initial_condition(x.id())
    }

    /// First recorded dependency named `name`.
    pub fn find_initial_condition(&self, name: &str) -> TapeResult<Variable> {
        self.tape
            .equations()
            .flat_map(|eq| eq.dependencies())
            .find(|dep| dep.name() == name)
            .cloned()
            .ok_or_else(|| TapeError::missing(format!("no recorded dependency named {:?}", name)))
    }

    /// Logs a status report and returns it.
    pub fn info(&self) -> ManagerInfo {
        let open = usize::from(self.tape.open_len() > 0);
        let info = ManagerInfo {
            manager: self.id,
            annotation: self.annotation,
            tlm: self.tlm,
            mode: self.schedule.mode(),
            blocks: self.tape.n_blocks() + open,
            equations: self.tape.equation_count(),
            store_ics: self.cp.store_ics(),
            store_data: self.cp.store_data(),
            initial_conditions_stored: self.cp.initial_condition_count(),
            initial_conditions_referenced: self.cp.reference_count(),
            equations_with_data: self.cp.equation_count(),
            fast_snapshots: self.schedule.snapshots_in(Tier::Fast),
            slow_snapshots: self.schedule.snapshots_in(Tier::Slow),
            tangent_linear_models: self.tlm_models.len(),
            stats: self.stats,
        };

        tracing::info!(
            manager = info.manager,
            annotation = %info.annotation,
            tlm = %info.tlm,
            mode = %info.mode,
            blocks = info.blocks,
            equations = info.equations,
            "equation manager status"
        );
        tracing::info!(
            store_ics = info.store_ics,
            store_data = info.store_data,
            stored = info.initial_conditions_stored,
            referenced = info.initial_conditions_referenced,
            with_data = info.equations_with_data,
            "checkpoint storage"
        );
        tracing::info!(
            fast = info.fast_snapshots,
            slow = info.slow_snapshots,
            replayed_blocks = info.stats.replayed_blocks,
            saved = info.stats.snapshots_saved,
            loaded = info.stats.snapshots_loaded,
            deleted = info.stats.snapshots_deleted,
            "snapshots"
        );

        let blocks = (0..self.tape.n_blocks())
            .map(|b| self.tape.block(b).collect::<Vec<_>>())
            .chain(std::iter::once(self.tape.open_block().collect::<Vec<_>>()));
        for (b, block) in blocks.enumerate() {
            for (k, eq) in block.iter().enumerate() {
                let nl = eq.nonlinear_dependency_indices();
                let deps: Vec<String> = eq
                    .dependencies()
                    .iter()
                    .enumerate()
                    .map(|(i, dep)| {
                        let kind = if nl.contains(&i) { "non-linear" } else { "linear" };
                        let replaced = if dep.is_placeholder() { ", replaced" } else { "" };
                        format!("{} ({}{})", dep, kind, replaced)
                    })
                    .collect();
                tracing::debug!(
                    block = b,
                    equation = k,
                    name = eq.name(),
                    dependencies = %deps.join(", "),
                    "recorded equation"
                );
            }
        }
        info
    }
}

impl Drop for EquationManager {
    fn drop(&mut self) {
        if let Err(err) = self.tiers.clear() {
            tracing::warn!(manager = self.id, error = %err, "failed to remove snapshots");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{Assignment, Pointwise, PointwiseOp};
    use tape_core::FunctionSpace;

    fn scalar_setup() -> (Arc<FunctionSpace>, Variable, Variable, Workspace) {
        let space = FunctionSpace::scalar();
        let a = Variable::new(&space, "a");
        let b = Variable::new(&space, "b");
        let mut ws = Workspace::new();
        ws.set(&a, Field::constant(&space, 2.0)).unwrap();
        (space, a, b, ws)
    }

    // ========================================================================
    // State machine
    // ========================================================================

    #[test]
    fn test_stop_start_returns_previous_enablement() {
        let mut manager = EquationManager::new();
        assert_eq!(manager.stop(true, true), (true, true));
        assert_eq!(manager.annotation_state(), AnnotationState::StoppedInitial);
        assert_eq!(manager.stop(true, true), (false, false));
        assert_eq!(manager.start(true, false), (false, false));
        assert_eq!(manager.annotation_state(), AnnotationState::Initial);
        assert_eq!(manager.tlm_state(), TlmState::StoppedInitial);
    }

    #[test]
    fn test_stopped_annotation_ignores_equations() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager.stop(true, false);
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        assert_eq!(ws.get(&b).unwrap().values(), &[2.0]);
        assert_eq!(manager.tape().equation_count(), 0);
        assert_eq!(manager.annotation_state(), AnnotationState::StoppedInitial);
    }

    #[test]
    fn test_add_equation_after_finalize_is_invalid_state() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        manager.finalize().unwrap();
        let err = manager
            .add_equation(Box::new(Assignment::new(&b, &a).unwrap()), &ws)
            .unwrap_err();
        assert!(matches!(err, TapeError::InvalidState(_)));
    }

    #[test]
    fn test_finalize_is_idempotent_and_blocks_stay_closed() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        manager.finalize().unwrap();
        manager.finalize().unwrap();
        manager.new_block().unwrap();
        assert_eq!(manager.tape().n_blocks(), 1);
        assert_eq!(manager.annotation_state(), AnnotationState::Final);
        assert_eq!(manager.tlm_state(), TlmState::Final);
    }

    #[test]
    fn test_failed_finalize_leaves_manager_recording() {
        let (space, a, b, mut ws) = scalar_setup();
        let c = Variable::new(&space, "c");
        let mut manager = EquationManager::with_config(CheckpointConfig::binomial(3, 1, 0)).unwrap();
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        manager.new_block().unwrap();
        manager
            .solve(Box::new(Pointwise::new(&c, &b, PointwiseOp::Square).unwrap()), &mut ws)
            .unwrap();

        // Two blocks of three
        let err = manager.finalize().unwrap_err();
        assert!(matches!(err, TapeError::InvalidState(_)));
        assert_eq!(manager.annotation_state(), AnnotationState::Annotating);
        assert_eq!(manager.tape().n_blocks(), 1);
        assert_eq!(manager.tape().open_len(), 1);

        manager.new_block().unwrap();
        manager
            .solve(Box::new(Pointwise::new(&b, &c, PointwiseOp::Square).unwrap()), &mut ws)
            .unwrap();
        manager.finalize().unwrap();
        assert_eq!(manager.annotation_state(), AnnotationState::Final);
        assert_eq!(manager.tape().n_blocks(), 3);

        let dj = manager.compute_gradient(&[b], &[a]).unwrap();
        // b = a^4 at a = 2
        assert_eq!(dj[0][0].values(), &[32.0]);
    }

    #[test]
    fn test_tlm_registry() {
        let (space, a, _, _) = scalar_setup();
        let da = Variable::new(&space, "da");
        let mut manager = EquationManager::new();
        assert!(!manager.tlm_enabled());
        manager.add_tlm(&[a.clone()], &[da.clone()]).unwrap();
        assert!(manager.tlm_enabled());
        let err = manager.add_tlm(&[a.clone()], &[da.clone()]).unwrap_err();
        assert!(err.is_configuration());

        manager.finalize().unwrap();
        let err = manager.add_tlm(&[da], &[a]).unwrap_err();
        assert!(matches!(err, TapeError::InvalidState(_)));
    }

    #[test]
    fn test_solve_derives_tangents() {
        let (space, a, b, mut ws) = scalar_setup();
        let da = Variable::new(&space, "da");
        ws.set(&da, Field::constant(&space, 0.5)).unwrap();
        let mut manager = EquationManager::new();
        manager.add_tlm(&[a.clone()], &[da.clone()]).unwrap();

        manager
            .solve(Box::new(Pointwise::new(&b, &a, PointwiseOp::Square).unwrap()), &mut ws)
            .unwrap();
        let tau_b = manager.tlm(&[a.clone()], &[da.clone()], &b).unwrap();
        assert_eq!(tau_b.name(), "b_tlm(a,da)");
        // d(a^2) = 2 a da at a = 2
        assert_eq!(ws.get(&tau_b).unwrap().values(), &[2.0]);
        assert_eq!(manager.tape().open_len(), 2);

        // Writing a control is rejected before anything is solved.
        let err = manager
            .solve(Box::new(Assignment::new(&a, &b).unwrap()), &mut ws)
            .unwrap_err();
        assert!(matches!(err, TapeError::InvalidParameter(_)));
        assert_eq!(manager.tape().open_len(), 2);
        assert!(manager.tlm(&[a.clone()], &[da.clone()], &a).is_err());

        // Stopped derivation leaves the tangents alone.
        manager.stop(false, true);
        let c = Variable::new(&space, "c");
        manager
            .solve(Box::new(Assignment::new(&c, &b).unwrap()), &mut ws)
            .unwrap();
        assert!(manager.tlm(&[a], &[da], &c).is_err());
        assert_eq!(manager.tape().open_len(), 3);
    }

    #[test]
    fn test_configure_after_annotation_rejected() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager
            .configure_checkpointing(CheckpointConfig::binomial(3, 1, 0))
            .unwrap();
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        let err = manager
            .configure_checkpointing(CheckpointConfig::memory())
            .unwrap_err();
        assert!(matches!(err, TapeError::InvalidState(_)));

        manager.reset_with(CheckpointConfig::memory()).unwrap();
        assert_eq!(manager.annotation_state(), AnnotationState::Initial);
        assert!(manager.tape().is_empty());
        assert_eq!(manager.config().mode, CheckpointMode::AllInMemory);
    }

    // ========================================================================
    // Recording
    // ========================================================================

    #[test]
    fn test_rejects_equation_listing_output_as_input() {
        #[derive(Debug)]
        struct Bad {
            deps: Vec<Variable>,
        }
        impl Equation for Bad {
            fn id(&self) -> EquationId {
                EquationId::next()
            }
            fn name(&self) -> &'static str {
                "Bad"
            }
            fn outputs(&self) -> &[Variable] {
                &self.deps[..1]
            }
            fn dependencies(&self) -> &[Variable] {
                &self.deps
            }
            fn nonlinear_dependency_indices(&self) -> &[usize] {
                &[]
            }
            fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
                Ok(vec![deps[0].clone()])
            }
            fn adjoint(&self, _: &[Field], _: &[Field]) -> TapeResult<Option<Vec<Field>>> {
                Ok(None)
            }
            fn partial_route(&self, _: usize, _: &[Field], _: &[Field]) -> TapeResult<Option<Field>> {
                Ok(None)
            }
            fn replace(&mut self, _: &HashMap<VarId, Variable>) {}
        }

        let (_, a, _, ws) = scalar_setup();
        let mut manager = EquationManager::new();
        let err = manager
            .add_equation(Box::new(Bad { deps: vec![a.clone(), a] }), &ws)
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(manager.annotation_state(), AnnotationState::Initial);
    }

    #[test]
    fn test_release_swaps_in_placeholders() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        let eq = Pointwise::new(&b, &a, PointwiseOp::Square).unwrap();
        let id = eq.id();
        manager.solve(Box::new(eq), &mut ws).unwrap();

        manager.release(id).unwrap();
        manager.release(id).unwrap();
        assert!(manager.map(&a).is_placeholder());
        assert!(!manager.map(&Variable::new(a.space(), "c")).is_placeholder());
        assert!(manager
            .tape()
            .equations()
            .all(|eq| eq.dependencies().iter().all(Variable::is_placeholder)));

        // Values are still found by id.
        let dj = manager.compute_gradient(&[b], &[a]).unwrap();
        assert_eq!(dj[0][0].values(), &[4.0]);
    }

    #[test]
    fn test_find_initial_condition_by_name() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager
            .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
            .unwrap();
        assert_eq!(manager.find_initial_condition("a").unwrap(), a);
        assert!(manager.find_initial_condition("zz").is_err());
    }

    #[test]
    fn test_info_counts() {
        let (_, a, b, mut ws) = scalar_setup();
        let mut manager = EquationManager::new();
        manager
            .solve(Box::new(Pointwise::new(&b, &a, PointwiseOp::Sin).unwrap()), &mut ws)
            .unwrap();
        let info = manager.info();
        assert_eq!(info.blocks, 1);
        assert_eq!(info.equations, 1);
        assert_eq!(info.initial_conditions_stored, 1);
        assert_eq!(info.equations_with_data, 1);
        assert_eq!(info.annotation, AnnotationState::Annotating);
        assert_eq!(info.mode, CheckpointMode::AllInMemory);
    }
}
