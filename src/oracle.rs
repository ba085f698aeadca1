use crate::asset::{Asset, AssetKind};
use crate::constraint::{ConstraintSide, LinearConstraint};
use crate::error::{Error, Result};
use crate::event::{EventHandler, EventRegistry, EventType, Modification, ModificationBus};
use crate::linearization::LinearizationBuilder;
use crate::operation::{
    OperationalModel, Sense, SolverStatus, StageSolution, UnitKind, UnitNode,
};
use crate::pool::{GlobalPool, LinearizationKind, PoolState};
use crate::scheduler::ScenarioScheduler;
use crate::state::StateBridge;
use crate::utils;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Mutex;

/// Builds one independent copy of the nested operational model. Called
/// once per evaluator slot, lazily on the first compute.
pub type ModelFactory = Box<dyn Fn() -> Box<dyn OperationalModel> + Send + Sync>;

/// Outcome of the most recent `compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleStatus {
    Unevaluated,
    Evaluating,
    Ok,
    Error,
    Infeasible,
    Unbounded,
    StoppedTime,
    StoppedIter,
}

/// Tuning parameters of the oracle. Every field can also be set through
/// [`InvestmentOracle::set_parameter`] under its field name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleOptions {
    /// Whether linearizations are computed alongside the value.
    pub compute_linearization: bool,
    /// Maximum absolute error accepted in the multipliers of a linear
    /// combination of linearizations.
    pub multiplier_tolerance: f64,
    /// Relative tolerance for declaring a linear side constraint
    /// satisfied.
    pub constraints_tolerance: f64,
    /// Whether per-scenario operational values are reported while
    /// computing.
    pub output_solution: bool,
    /// Path of a file into which variable and function values are
    /// appended on every compute; empty disables the output.
    pub output_filename: String,
    /// Invest in battery units by replication instead of by scaling
    /// their capacity parameter.
    pub replicate_battery: bool,
    /// Invest in intermittent units by replication instead of by
    /// scaling their capacity parameter.
    pub replicate_intermittent: bool,
    /// Number of evaluator slots (and of parallel scenario workers).
    pub num_slots: usize,
    /// Initial size of the global pool of linearizations.
    pub global_pool_size: usize,
}

impl Default for OracleOptions {
    fn default() -> Self {
        Self {
            compute_linearization: true,
            multiplier_tolerance: 1e-10,
            constraints_tolerance: 1e-6,
            output_solution: false,
            output_filename: String::new(),
            replicate_battery: false,
            replicate_intermittent: false,
            num_slots: 1,
            global_pool_size: 0,
        }
    }
}

/// The investment function `F(x)`: expected operational cost of the
/// nested stochastic model parameterized by the investment vector, plus
/// the linear (dis)investment cost, subject to linear side constraints.
///
/// `compute` either produces a finite value together with a diagonal
/// linearization (a subgradient at `x`) or, when a side constraint is
/// violated, the worst value together with a vertical linearization
/// separating `x` from the feasible region.
pub struct InvestmentOracle {
    assets: Vec<Asset>,
    constraints: Vec<LinearConstraint>,
    options: OracleOptions,
    factory: ModelFactory,
    slots: Vec<Mutex<Box<dyn OperationalModel>>>,
    scheduler: ScenarioScheduler,
    pool: GlobalPool,
    events: EventRegistry,
    bus: ModificationBus,
    sense: Sense,
    reformulated_bounds: bool,
    status: OracleStatus,
    value: f64,
    has_value: bool,
    linearization: Vec<f64>,
    has_diagonal: bool,
    diagonal_required: bool,
    violated: Option<(usize, ConstraintSide)>,
    last_point: Option<Vec<f64>>,
    models_updated: bool,
    ignore_modifications: bool,
}

impl InvestmentOracle {
    pub fn new(
        assets: Vec<Asset>,
        constraints: Vec<LinearConstraint>,
        factory: ModelFactory,
        options: OracleOptions,
    ) -> Self {
        for constraint in constraints.iter() {
            assert_eq!(
                constraint.coefficients().len(),
                assets.len(),
                "every side constraint must have one coefficient per asset"
            );
        }
        let num_variables = assets.len();
        Self {
            assets,
            constraints,
            pool: GlobalPool::with_size(options.global_pool_size),
            scheduler: ScenarioScheduler::new(options.num_slots),
            options,
            factory,
            slots: vec![],
            events: EventRegistry::new(),
            bus: ModificationBus::new(),
            sense: Sense::Minimise,
            reformulated_bounds: false,
            status: OracleStatus::Unevaluated,
            value: 0.0,
            has_value: false,
            linearization: vec![0.0; num_variables],
            has_diagonal: false,
            diagonal_required: true,
            violated: None,
            last_point: None,
            models_updated: false,
            ignore_modifications: false,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.assets.len()
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn status(&self) -> OracleStatus {
        self.status
    }

    pub fn objective_sense(&self) -> Sense {
        self.sense
    }

    fn worst_value(&self) -> f64 {
        self.sense.worst_value()
    }

    /// The value of the most recent compute, or the worst possible
    /// value if none is available.
    pub fn value(&self) -> f64 {
        if self.has_value {
            self.value
        } else {
            self.worst_value()
        }
    }

    /// Tells the oracle that the natural bounds `l <= x <= u` on the
    /// variables have been reformulated into `0 <= x <= u - l`, so that
    /// every external read of a variable must be translated by its
    /// finite lower bound.
    pub fn set_reformulated_bounds(&mut self, reformulated: bool) {
        self.reformulated_bounds = reformulated;
    }

    /// The externalized value of the i-th variable: under reformulated
    /// bounds the finite lower bound is added back.
    fn externalized(&self, x: &[f64], i: usize) -> f64 {
        if self.reformulated_bounds && self.assets[i].lower_bound.is_finite() {
            x[i] + self.assets[i].lower_bound
        } else {
            x[i]
        }
    }

    fn externalized_point(&self, x: &[f64]) -> Vec<f64> {
        (0..x.len()).map(|i| self.externalized(x, i)).collect()
    }

    /// Evaluates the investment function at `x`. An unchanged point with
    /// no intervening modification re-emits the cached result. Errors
    /// raised by workers during the scenario loop surface as status
    /// [`OracleStatus::Error`] (or `Infeasible`/`Unbounded` when an
    /// inner solver reported so); structural errors are fatal and
    /// propagate.
    pub fn compute(&mut self, x: &[f64]) -> Result<OracleStatus> {
        assert_eq!(x.len(), self.assets.len());

        if self.models_updated && self.last_point.as_deref() == Some(x) {
            self.events.fire(EventType::BeforeTermination);
            return Ok(self.status);
        }

        self.output_variable_values(x);
        self.last_point = Some(x.to_vec());
        self.linearization = vec![0.0; self.assets.len()];
        self.has_diagonal = false;
        self.has_value = false;
        self.violated = None;
        self.status = OracleStatus::Evaluating;

        if !self.scan_side_constraints(x) {
            self.value = self.worst_value();
            self.has_value = true;
            self.status = OracleStatus::Ok;
            self.output_function_value();
            self.events.fire(EventType::BeforeTermination);
            return Ok(self.status);
        }

        self.ensure_slots();

        let saved_ignore = self.ignore_modifications;
        self.ignore_modifications = true;

        if let Err(error) = self.apply_point(x) {
            warn!("failed to parameterize the operational models: {error}");
            self.ignore_modifications = saved_ignore;
            self.value = self.worst_value();
            self.status = OracleStatus::Error;
            self.output_function_value();
            self.events.fire(EventType::BeforeTermination);
            return Ok(self.status);
        }
        self.models_updated = true;

        let num_scenarios = self.slots[0].lock().unwrap().num_scenarios();
        debug!(
            "evaluating {num_scenarios} scenarios on {} evaluator slots",
            self.scheduler.num_slots()
        );

        struct Accumulator {
            value: f64,
            gradient: Vec<f64>,
            solver_status: SolverStatus,
        }

        let accumulator = Mutex::new(Accumulator {
            value: 0.0,
            gradient: vec![0.0; self.assets.len()],
            solver_status: SolverStatus::Ok,
        });
        let interrupt = AtomicBool::new(false);
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let bridge = StateBridge::new(num_scenarios == 1);

        let slots = &self.slots;
        let scheduler = &self.scheduler;
        let assets = &self.assets;
        let options = &self.options;

        (0..num_scenarios).into_par_iter().for_each(|scenario| {
            if interrupt.load(Ordering::Relaxed) {
                return;
            }
            let slot = scheduler.acquire();
            let mut model = slots[slot.index()].lock().unwrap();
            match evaluate_scenario(model.as_mut(), scenario, &bridge, assets, options) {
                Ok(outcome) => {
                    if options.output_solution {
                        info!(
                            "scenario {scenario}: operational value {}",
                            outcome.value
                        );
                    }
                    let mut accumulator = accumulator.lock().unwrap();
                    accumulator.value += outcome.value;
                    utils::axpy(&mut accumulator.gradient, &outcome.gradient, 1.0);
                    if outcome.status != SolverStatus::Ok {
                        accumulator.solver_status = outcome.status;
                    }
                }
                Err(error) => {
                    interrupt.store(true, Ordering::Relaxed);
                    let mut failure = failure.lock().unwrap();
                    if failure.is_none() {
                        *failure = Some(error);
                    }
                }
            }
        });

        self.ignore_modifications = saved_ignore;

        if let Some(error) = failure.into_inner().unwrap() {
            self.value = self.worst_value();
            self.status = match &error {
                Error::SolverFailure {
                    status:
                        SolverStatus::Infeasible | SolverStatus::SubproblemInfeasible,
                    ..
                } => OracleStatus::Infeasible,
                Error::SolverFailure {
                    status: SolverStatus::Unbounded,
                    ..
                } => OracleStatus::Unbounded,
                _ => OracleStatus::Error,
            };
            self.output_function_value();
            self.events.fire(EventType::BeforeTermination);
            return match error {
                fatal @ (Error::StructureMismatch { .. } | Error::OutOfRange(_)) => {
                    Err(fatal)
                }
                error => {
                    warn!("scenario evaluation interrupted: {error}");
                    Ok(self.status)
                }
            };
        }

        let accumulator = accumulator.into_inner().unwrap();
        let weight = 1.0 / num_scenarios as f64;
        self.value = accumulator.value * weight;
        self.linearization = accumulator.gradient;
        utils::scale(&mut self.linearization, weight);

        // fixed (dis)investment cost relative to the installed baseline
        for i in 0..self.assets.len() {
            let installed = self.assets[i].installed_quantity;
            let external = self.externalized(x, i);
            if external > installed {
                self.value += self.assets[i].cost * (external - installed);
                self.linearization[i] += self.assets[i].cost;
            } else {
                self.value +=
                    self.assets[i].disinvestment_cost * (installed - external);
                self.linearization[i] -= self.assets[i].disinvestment_cost;
            }
        }

        self.has_value = true;
        self.has_diagonal = self.options.compute_linearization;
        self.status = match accumulator.solver_status {
            SolverStatus::StopTime => OracleStatus::StoppedTime,
            SolverStatus::StopIter => OracleStatus::StoppedIter,
            _ => OracleStatus::Ok,
        };
        self.output_function_value();
        self.events.fire(EventType::BeforeTermination);
        Ok(self.status)
    }

    fn ensure_slots(&mut self) {
        if !self.slots.is_empty() {
            return;
        }
        for _ in 0..self.options.num_slots {
            self.slots.push(Mutex::new((self.factory)()));
        }
        self.sense = self.slots[0].lock().unwrap().objective_sense();
    }

    /// Applies the externalized investment point to every evaluator
    /// slot: scale factors for replication assets, capacity parameters
    /// for kappa assets, and a batched kappa update for the lines.
    fn apply_point(&self, x: &[f64]) -> Result<()> {
        let mut line_indices = vec![];
        let mut line_values = vec![];
        for (i, asset) in self.assets.iter().enumerate() {
            if asset.kind == AssetKind::Line {
                line_indices.push(asset.index);
                line_values.push(self.externalized(x, i));
            }
        }

        for slot in self.slots.iter() {
            let mut model = slot.lock().unwrap();
            for (i, asset) in self.assets.iter().enumerate() {
                if asset.kind != AssetKind::Unit {
                    continue;
                }
                let value = self.externalized(x, i);
                let kind = find_unit_kind(model.stage_topology(0), asset.index)
                    .ok_or_else(|| {
                        Error::OutOfRange(format!(
                            "unit block {} does not exist in the operational model",
                            asset.index
                        ))
                    })?;
                match kind {
                    UnitKind::Thermal => model.apply_unit_scale(asset.index, value),
                    UnitKind::Battery => {
                        if self.options.replicate_battery {
                            model.apply_unit_scale(asset.index, value);
                        } else {
                            model.apply_unit_kappa(asset.index, value);
                        }
                    }
                    UnitKind::Intermittent => {
                        if self.options.replicate_intermittent {
                            model.apply_unit_scale(asset.index, value);
                        } else {
                            model.apply_unit_kappa(asset.index, value);
                        }
                    }
                    UnitKind::Hydro => {
                        return Err(Error::UnsupportedAssetKind(format!(
                            "hydro unit block {} cannot be an investment asset",
                            asset.index
                        )));
                    }
                }
            }
            if !line_indices.is_empty() {
                model.apply_line_kappa(&line_indices, &line_values);
            }
        }
        Ok(())
    }

    /// Scans the side constraints from the first unverified row, with a
    /// relative tolerance on each side. Records the first violated
    /// (row, side) pair and returns false on violation.
    fn scan_side_constraints(&mut self, x: &[f64]) -> bool {
        let external = self.externalized_point(x);
        let start = self.violated.map_or(0, |(row, _)| row + 1);
        let tolerance = self.options.constraints_tolerance;

        for row in start..self.constraints.len() {
            let value = self.constraints[row].value_at(&external);

            let lower = self.constraints[row].lower_bound();
            let lower_violation = lower - value;
            if lower_violation > 0.0
                && lower_violation / f64::max(1.0, lower.abs()) > tolerance
            {
                self.violated = Some((row, ConstraintSide::Lower));
                return false;
            }

            let upper = self.constraints[row].upper_bound();
            let upper_violation = value - upper;
            if upper_violation > 0.0
                && upper_violation / f64::max(1.0, upper.abs()) > tolerance
            {
                self.violated = Some((row, ConstraintSide::Upper));
                return false;
            }
        }
        true
    }

    /// Whether a linearization of the requested kind is available for
    /// the most recent compute. Asking also selects which kind the
    /// subsequent coefficient and constant reads refer to.
    pub fn has_linearization(&mut self, diagonal: bool) -> bool {
        self.diagonal_required = diagonal;
        if diagonal {
            self.has_diagonal
        } else {
            self.violated.is_some()
        }
    }

    /// Tries to produce one more linearization of the requested kind: a
    /// further vertical linearization exists iff scanning the remaining
    /// side constraints finds another violated row.
    pub fn compute_new_linearization(&mut self, diagonal: bool) -> bool {
        if diagonal {
            return false;
        }
        match self.last_point.clone() {
            Some(x) => !self.scan_side_constraints(&x),
            None => false,
        }
    }

    fn vertical_coefficients(&self) -> Result<Vec<f64>> {
        let (row, side) = self.violated.ok_or_else(|| {
            Error::OutOfRange("no violated side constraint has been recorded".to_string())
        })?;
        let sign = match side {
            ConstraintSide::Lower => -1.0,
            ConstraintSide::Upper => 1.0,
        };
        Ok(self.constraints[row]
            .coefficients()
            .iter()
            .map(|&coefficient| sign * coefficient)
            .collect())
    }

    /// Coefficients of the most recently selected linearization (see
    /// [`InvestmentOracle::has_linearization`]).
    pub fn linearization_coefficients(&self) -> Result<Vec<f64>> {
        if self.diagonal_required {
            Ok(self.linearization.clone())
        } else {
            self.vertical_coefficients()
        }
    }

    /// Constant of the most recently selected linearization, computed
    /// with externalized variable values so that it is invariant under
    /// bound reformulation.
    pub fn linearization_constant(&self) -> Result<f64> {
        let x = self.last_point.as_ref().ok_or_else(|| {
            Error::OutOfRange("the function has not been computed".to_string())
        })?;
        if self.diagonal_required {
            let mut constant = self.value;
            for i in 0..x.len() {
                constant -= self.linearization[i] * self.externalized(x, i);
            }
            Ok(constant)
        } else {
            let (row, side) = self.violated.ok_or_else(|| {
                Error::OutOfRange(
                    "no violated side constraint has been recorded".to_string(),
                )
            })?;
            let external = self.externalized_point(x);
            let value = self.constraints[row].value_at(&external);
            Ok(match side {
                ConstraintSide::Lower => self.constraints[row].lower_bound() - value,
                ConstraintSide::Upper => value - self.constraints[row].upper_bound(),
            })
        }
    }

    /// Stores the most recently selected linearization in the global
    /// pool under the given name.
    pub fn store_linearization(&mut self, name: usize) -> Result<()> {
        let constant = self.linearization_constant()?;
        let (coefficients, kind) = if self.diagonal_required {
            (self.linearization.clone(), LinearizationKind::Diagonal)
        } else {
            (self.vertical_coefficients()?, LinearizationKind::Vertical)
        };
        self.pool.store(name, constant, coefficients, kind)?;
        self.bus.broadcast(Modification::PoolAdded(vec![name]));
        Ok(())
    }

    /// Stores a combination of pool entries under the given name.
    pub fn store_combination_of_linearizations(
        &mut self,
        combination: &[(usize, f64)],
        name: usize,
    ) -> Result<()> {
        self.pool
            .combine(combination, name, self.options.multiplier_tolerance)?;
        self.bus.broadcast(Modification::PoolAdded(vec![name]));
        Ok(())
    }

    pub fn delete_linearization(&mut self, name: usize) -> Result<()> {
        self.pool.delete(name)?;
        self.bus.broadcast(Modification::PoolRemoved(vec![name]));
        Ok(())
    }

    pub fn delete_linearizations(&mut self, names: &[usize]) -> Result<()> {
        self.pool.delete_many(names)?;
        self.bus.broadcast(Modification::PoolRemoved(names.to_vec()));
        Ok(())
    }

    pub fn set_important_linearization(&mut self, combination: Vec<(usize, f64)>) {
        self.pool.set_important_linearization(combination);
    }

    /// Read-only view of the global pool.
    pub fn pool(&self) -> &GlobalPool {
        &self.pool
    }

    /// Snapshot of the global pool in its persisted form.
    pub fn state(&self) -> PoolState {
        self.pool.state()
    }

    /// Restores the global pool from a snapshot, notifying observers
    /// that the previous entries are gone and the restored ones are
    /// available.
    pub fn restore_state(&mut self, state: &PoolState) -> Result<()> {
        let was_empty = self.pool.is_empty();
        self.pool.restore(state)?;
        if !was_empty {
            self.bus.broadcast(Modification::PoolRemoved(vec![]));
        }
        let added: Vec<usize> = (0..self.pool.size())
            .filter(|&name| self.pool.is_present(name))
            .collect();
        if !added.is_empty() {
            self.bus.broadcast(Modification::PoolAdded(added));
        }
        Ok(())
    }

    /// Signals that the variables or the underlying model changed in a
    /// way that invalidates everything: cached results are reset, every
    /// pool constant becomes NaN and observers receive a nuclear
    /// modification. Suppressed while an evaluation is running.
    pub fn note_modification(&mut self) {
        if self.ignore_modifications {
            return;
        }
        self.pool.invalidate_all();
        self.models_updated = false;
        self.has_value = false;
        self.has_diagonal = false;
        self.violated = None;
        self.status = OracleStatus::Unevaluated;
        self.bus.broadcast(Modification::NaNShift);
    }

    /// Removes the variables (and their assets and constraint columns)
    /// with the given indices; an empty list removes every variable.
    pub fn remove_variables(&mut self, indices: &[usize]) -> Result<()> {
        let removed: Vec<usize> = if indices.is_empty() {
            (0..self.assets.len()).collect()
        } else {
            let mut sorted = indices.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.last().is_some_and(|&last| last >= self.assets.len()) {
                return Err(Error::OutOfRange(format!(
                    "variable index {} does not exist",
                    sorted.last().unwrap()
                )));
            }
            sorted
        };

        let keep = |i: &usize| !removed.contains(i);
        self.assets = self
            .assets
            .iter()
            .enumerate()
            .filter(|(i, _)| keep(i))
            .map(|(_, asset)| asset.clone())
            .collect();
        self.constraints = self
            .constraints
            .iter()
            .map(|constraint| {
                let coefficients = constraint
                    .coefficients()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| keep(i))
                    .map(|(_, &coefficient)| coefficient)
                    .collect();
                LinearConstraint::new(
                    coefficients,
                    constraint.lower_bound(),
                    constraint.upper_bound(),
                )
            })
            .collect();

        self.linearization = vec![0.0; self.assets.len()];
        self.last_point = None;
        self.models_updated = false;
        self.has_value = false;
        self.has_diagonal = false;
        self.violated = None;
        self.status = OracleStatus::Unevaluated;
        self.bus.broadcast(Modification::VariablesRemoved(removed));
        Ok(())
    }

    /// Sets a tuning parameter by key. Unknown keys, and keys of a
    /// different type than the given value, fail with
    /// [`Error::UnknownParameter`].
    pub fn set_parameter<V: ParameterValue>(&mut self, name: &str, value: V) -> Result<()> {
        value.apply(self, name)
    }

    fn resize_pool(&mut self, size: usize) {
        let old_size = self.pool.size();
        self.pool.resize(size);
        if size < old_size {
            self.bus
                .broadcast(Modification::PoolRemoved((size..old_size).collect()));
        }
    }

    pub fn set_event_handler(
        &mut self,
        event_type: EventType,
        handler: EventHandler,
    ) -> usize {
        self.events.set_handler(event_type, handler)
    }

    pub fn reset_event_handler(&mut self, event_type: EventType, id: usize) -> Result<()> {
        self.events.reset_handler(event_type, id)
    }

    /// Opens a channel on which the outbound modification messages of
    /// this oracle are delivered.
    pub fn subscribe_modifications(&mut self) -> Receiver<Modification> {
        self.bus.subscribe()
    }

    fn output_variable_values(&self, x: &[f64]) {
        if self.options.output_filename.is_empty() {
            return;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.options.output_filename)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "Variables: {}", x.len());
                for i in 0..x.len() {
                    let _ = writeln!(file, "{:.20}", self.externalized(x, i));
                }
            }
            Err(error) => warn!(
                "could not open '{}': {error}",
                self.options.output_filename
            ),
        }
    }

    fn output_function_value(&self) {
        if self.options.output_filename.is_empty() {
            return;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.options.output_filename)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "Function value: {}", self.value);
            }
            Err(error) => warn!(
                "could not open '{}': {error}",
                self.options.output_filename
            ),
        }
    }
}

/// A value that can be assigned to a named tuning parameter of the
/// oracle, in the spirit of typed solver options.
pub trait ParameterValue {
    fn apply(self, oracle: &mut InvestmentOracle, name: &str) -> Result<()>;
}

impl ParameterValue for bool {
    fn apply(self, oracle: &mut InvestmentOracle, name: &str) -> Result<()> {
        match name {
            "compute_linearization" => oracle.options.compute_linearization = self,
            "output_solution" => oracle.options.output_solution = self,
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }
}

impl ParameterValue for i64 {
    fn apply(self, oracle: &mut InvestmentOracle, name: &str) -> Result<()> {
        match name {
            "compute_linearization" => {
                oracle.options.compute_linearization = self != 0;
            }
            "output_solution" => oracle.options.output_solution = self != 0,
            "global_pool_max" => {
                if self < 0 {
                    return Err(Error::OutOfRange(
                        "global_pool_max must be nonnegative".to_string(),
                    ));
                }
                oracle.resize_pool(self as usize);
            }
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }
}

impl ParameterValue for f64 {
    fn apply(self, oracle: &mut InvestmentOracle, name: &str) -> Result<()> {
        match name {
            "multiplier_tolerance" => oracle.options.multiplier_tolerance = self,
            "constraints_tolerance" => oracle.options.constraints_tolerance = self,
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }
}

impl ParameterValue for &str {
    fn apply(self, oracle: &mut InvestmentOracle, name: &str) -> Result<()> {
        match name {
            "output_filename" => oracle.options.output_filename = self.to_string(),
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }
}

fn find_unit_kind(topology: &[UnitNode], unit: usize) -> Option<UnitKind> {
    let mut queue: Vec<&UnitNode> = topology.iter().collect();
    while let Some(node) = queue.pop() {
        if node.unit == Some(unit) {
            return Some(node.kind);
        }
        queue.extend(node.children.iter());
    }
    None
}

struct ScenarioOutcome {
    value: f64,
    gradient: Vec<f64>,
    status: SolverStatus,
}

/// Drives the stage-by-stage greedy solve of one scenario, carrying the
/// terminal state between consecutive stages and accumulating the
/// subgradient contributions.
fn evaluate_scenario(
    model: &mut dyn OperationalModel,
    scenario: usize,
    bridge: &StateBridge,
    assets: &[Asset],
    options: &OracleOptions,
) -> Result<ScenarioOutcome> {
    let num_stages = model.num_stages();
    let sense = model.objective_sense();
    let mut builder = LinearizationBuilder::new(
        assets.len(),
        options.replicate_battery,
        options.replicate_intermittent,
    );
    let mut trace: Vec<StageSolution> = Vec::with_capacity(num_stages);
    let mut value = 0.0;
    let mut status = SolverStatus::Ok;

    for stage in 0..num_stages {
        if stage > 0 {
            bridge.carry(model, &trace, stage)?;
        }
        let stage_status = model.solve_stage(scenario, stage);
        if !stage_status.has_solution() {
            return Err(Error::SolverFailure {
                stage,
                status: stage_status,
            });
        }
        if stage_status != SolverStatus::Ok {
            status = stage_status;
        }
        let solution = model
            .stage_solution(stage)
            .ok_or(Error::SolverFailure {
                stage,
                status: SolverStatus::SolutionNotFound,
            })?
            .clone();
        value += solution.objective;
        if options.compute_linearization {
            builder.accumulate_stage(
                stage,
                &solution,
                model.stage_layout(stage),
                assets,
                sense,
            )?;
        }
        trace.push(solution);
    }

    Ok(ScenarioOutcome {
        value,
        gradient: builder.into_coefficients(),
        status,
    })
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::event::Modification;
    use crate::fixture::{Recorder, StubModel};
    use crate::operation::UnitInitialState;
    use float_cmp::assert_approx_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn zero_cost_oracle(num_assets: usize, options: OracleOptions) -> InvestmentOracle {
        let assets = (0..num_assets)
            .map(|i| Asset::unit(i).with_installed_quantity(0.0))
            .collect();
        let factory: ModelFactory = Box::new(move || {
            let mut model = StubModel::new(1, 1);
            for _ in 0..num_assets {
                model = model.with_unit(UnitKind::Thermal, 1);
            }
            Box::new(model)
        });
        InvestmentOracle::new(assets, vec![], factory, options)
    }

    #[test]
    fn test_feasibility_law() {
        let assets = vec![
            Asset::unit(0).with_installed_quantity(0.0),
            Asset::unit(1).with_installed_quantity(0.0),
        ];
        let constraints = vec![LinearConstraint::less_equal(vec![1.0, 1.0], 2.0)];
        let factory: ModelFactory = Box::new(|| {
            Box::new(
                StubModel::new(1, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_unit(UnitKind::Thermal, 1),
            )
        });
        let mut oracle = InvestmentOracle::new(
            assets,
            constraints,
            factory,
            OracleOptions::default(),
        );

        // feasible point: finite value, diagonal linearization
        let status = oracle.compute(&[1.0, 0.5]).unwrap();
        assert_eq!(status, OracleStatus::Ok);
        assert!(oracle.value().is_finite());
        assert!(oracle.has_linearization(true));
        assert!(!oracle.has_linearization(false));

        // infeasible point: worst value, vertical linearization
        let status = oracle.compute(&[3.0, 1.0]).unwrap();
        assert_eq!(status, OracleStatus::Ok);
        assert_eq!(oracle.value(), f64::INFINITY);
        assert!(!oracle.has_linearization(true));
        assert!(oracle.has_linearization(false));
        assert_eq!(
            oracle.linearization_coefficients().unwrap(),
            vec![1.0, 1.0]
        );
        assert_approx_eq!(f64, oracle.linearization_constant().unwrap(), 2.0);
    }

    #[test]
    fn test_scanning_resumes_past_the_first_violated_row() {
        let assets = vec![
            Asset::unit(0).with_installed_quantity(0.0),
            Asset::unit(1).with_installed_quantity(0.0),
        ];
        let constraints = vec![
            LinearConstraint::less_equal(vec![1.0, 1.0], 2.0),
            LinearConstraint::greater_equal(vec![0.0, 1.0], 5.0),
        ];
        let factory: ModelFactory = Box::new(|| {
            Box::new(
                StubModel::new(1, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_unit(UnitKind::Thermal, 1),
            )
        });
        let mut oracle = InvestmentOracle::new(
            assets,
            constraints,
            factory,
            OracleOptions::default(),
        );

        // both rows are violated at (3, 1); the first one is recorded
        oracle.compute(&[3.0, 1.0]).unwrap();
        assert!(oracle.has_linearization(false));
        assert_eq!(
            oracle.linearization_coefficients().unwrap(),
            vec![1.0, 1.0]
        );

        // a further vertical linearization comes from the second row,
        // whose lower side is violated
        assert!(oracle.compute_new_linearization(false));
        assert_eq!(
            oracle.linearization_coefficients().unwrap(),
            vec![0.0, -1.0]
        );
        assert_approx_eq!(f64, oracle.linearization_constant().unwrap(), 4.0);

        // no diagonal linearization can be produced on demand, and the
        // scan is exhausted
        assert!(!oracle.compute_new_linearization(true));
        assert!(!oracle.compute_new_linearization(false));
    }

    #[test]
    fn test_linear_cost_and_subgradient() {
        let mut oracle = zero_cost_oracle(2, OracleOptions::default());
        oracle.assets[0] = Asset::unit(0)
            .with_costs(10.0, 0.0)
            .with_installed_quantity(0.0)
            .with_bounds(0.0, 5.0);
        oracle.assets[1] = Asset::unit(1)
            .with_costs(20.0, 0.0)
            .with_installed_quantity(0.0)
            .with_bounds(0.0, 5.0);

        oracle.compute(&[3.0, 1.0]).unwrap();
        assert_approx_eq!(f64, oracle.value(), 50.0);
        assert!(oracle.has_linearization(true));
        assert_eq!(
            oracle.linearization_coefficients().unwrap(),
            vec![10.0, 20.0]
        );
    }

    #[test]
    fn test_disinvestment_branch() {
        let mut oracle = zero_cost_oracle(1, OracleOptions::default());
        oracle.assets[0] = Asset::unit(0)
            .with_costs(10.0, 3.0)
            .with_installed_quantity(4.0)
            .with_bounds(0.0, 10.0);

        oracle.compute(&[2.0]).unwrap();
        assert_approx_eq!(f64, oracle.value(), 6.0);
        oracle.has_linearization(true);
        assert_eq!(oracle.linearization_coefficients().unwrap(), vec![-3.0]);

        oracle.compute(&[6.0]).unwrap();
        assert_approx_eq!(f64, oracle.value(), 20.0);
        assert_eq!(oracle.linearization_coefficients().unwrap(), vec![10.0]);
    }

    #[test]
    fn test_cached_result_is_reemitted_without_solving() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let shared = Arc::clone(&recorder);
        let factory: ModelFactory = Box::new(move || {
            Box::new(
                StubModel::new(1, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_recorder(Arc::clone(&shared)),
            )
        });
        let mut oracle = InvestmentOracle::new(
            vec![Asset::unit(0).with_installed_quantity(0.0)],
            vec![],
            factory,
            OracleOptions::default(),
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        oracle.set_event_handler(
            EventType::BeforeTermination,
            Box::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
                crate::event::EventAction::Continue
            }),
        );

        oracle.compute(&[1.0]).unwrap();
        assert_eq!(recorder.lock().unwrap().solves.len(), 1);

        // same point, nothing changed: no solve, but the termination
        // event fires again
        oracle.compute(&[1.0]).unwrap();
        assert_eq!(recorder.lock().unwrap().solves.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // a different point triggers a fresh evaluation
        oracle.compute(&[2.0]).unwrap();
        assert_eq!(recorder.lock().unwrap().solves.len(), 2);
    }

    #[test]
    fn test_nuclear_modification_invalidates_everything() {
        let mut oracle = zero_cost_oracle(1, OracleOptions {
            global_pool_size: 2,
            ..OracleOptions::default()
        });
        let receiver = oracle.subscribe_modifications();

        oracle.compute(&[1.0]).unwrap();
        oracle.has_linearization(true);
        oracle.store_linearization(0).unwrap();
        assert!(oracle.pool().is_present(0));
        assert_eq!(receiver.recv().unwrap(), Modification::PoolAdded(vec![0]));

        oracle.note_modification();
        assert_eq!(oracle.status(), OracleStatus::Unevaluated);
        assert!(!oracle.pool().is_present(0));
        assert_eq!(receiver.recv().unwrap(), Modification::NaNShift);

        // notifying twice leaves the oracle in the same state
        oracle.note_modification();
        assert_eq!(oracle.status(), OracleStatus::Unevaluated);
    }

    #[test]
    fn test_solver_failure_yields_error_status_and_worst_value() {
        let factory: ModelFactory = Box::new(|| {
            Box::new(
                StubModel::new(1, 2)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_failure(1, 0, SolverStatus::SolutionNotFound),
            )
        });
        let mut oracle = InvestmentOracle::new(
            vec![Asset::unit(0).with_installed_quantity(0.0)],
            vec![],
            factory,
            OracleOptions::default(),
        );

        let status = oracle.compute(&[1.0]).unwrap();
        assert_eq!(status, OracleStatus::Error);
        assert_eq!(oracle.value(), f64::INFINITY);
        assert!(!oracle.has_linearization(true));

        // the slots were released: the next evaluation runs normally
        let status = oracle.compute(&[2.0]).unwrap();
        assert_eq!(status, OracleStatus::Error);
    }

    #[test]
    fn test_inner_infeasibility_is_reported() {
        let factory: ModelFactory = Box::new(|| {
            Box::new(
                StubModel::new(1, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_failure(0, 0, SolverStatus::SubproblemInfeasible),
            )
        });
        let mut oracle = InvestmentOracle::new(
            vec![Asset::unit(0)],
            vec![],
            factory,
            OracleOptions::default(),
        );
        assert_eq!(oracle.compute(&[1.0]).unwrap(), OracleStatus::Infeasible);
    }

    #[test]
    fn test_structure_mismatch_is_fatal() {
        let factory: ModelFactory = Box::new(|| {
            let mut model = StubModel::new(2, 1).with_unit(UnitKind::Thermal, 1);
            model.replace_stage_topology(
                1,
                vec![UnitNode::new(UnitKind::Battery, 1, 0)],
            );
            Box::new(model)
        });
        let mut oracle = InvestmentOracle::new(
            vec![Asset::unit(0)],
            vec![],
            factory,
            OracleOptions::default(),
        );

        let result = oracle.compute(&[1.0]);
        assert!(matches!(result, Err(Error::StructureMismatch { .. })));
        assert_eq!(oracle.status(), OracleStatus::Error);
    }

    #[test]
    fn test_point_application_dispatches_by_unit_kind() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let shared = Arc::clone(&recorder);
        let factory: ModelFactory = Box::new(move || {
            Box::new(
                StubModel::new(1, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_unit(UnitKind::Battery, 1)
                    .with_unit(UnitKind::Intermittent, 1)
                    .with_line(-10.0, 10.0)
                    .with_line(-20.0, 20.0)
                    .with_recorder(Arc::clone(&shared)),
            )
        });
        let assets = vec![
            Asset::unit(0),
            Asset::unit(1),
            Asset::unit(2),
            Asset::line(0),
            Asset::line(1),
        ];
        let mut oracle =
            InvestmentOracle::new(assets, vec![], factory, OracleOptions::default());

        let status = oracle.compute(&[2.0, 3.0, 4.0, 0.5, 0.25]).unwrap();
        assert_eq!(status, OracleStatus::Ok);

        let recorded = recorder.lock().unwrap();
        assert_eq!(recorded.scales, vec![(0, 2.0)]);
        assert_eq!(recorded.kappas, vec![(1, 3.0), (2, 4.0)]);
        assert_eq!(
            recorded.line_kappas,
            vec![(vec![0, 1], vec![0.5, 0.25])]
        );
    }

    #[test]
    fn test_state_is_carried_between_stages() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let shared = Arc::clone(&recorder);
        let factory: ModelFactory = Box::new(move || {
            Box::new(
                StubModel::new(3, 1)
                    .with_unit(UnitKind::Thermal, 1)
                    .with_recorder(Arc::clone(&shared)),
            )
        });
        let mut oracle = InvestmentOracle::new(
            vec![Asset::unit(0)],
            vec![],
            factory,
            OracleOptions::default(),
        );
        oracle.compute(&[1.0]).unwrap();

        let recorded = recorder.lock().unwrap();
        assert_eq!(recorded.solves, vec![(0, 0), (0, 1), (0, 2)]);
        assert_eq!(
            recorded.states,
            vec![
                (
                    1,
                    0,
                    UnitInitialState::Thermal {
                        power: 0.0,
                        up_down_time: None
                    }
                ),
                (
                    2,
                    0,
                    UnitInitialState::Thermal {
                        power: 0.0,
                        up_down_time: None
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_parallel_aggregation_is_slot_count_independent() {
        for num_slots in [1, 2, 4] {
            let factory: ModelFactory = Box::new(|| {
                Box::new(
                    StubModel::new(1, 4)
                        .with_unit(UnitKind::Thermal, 1)
                        .with_objective(5.0),
                )
            });
            let mut oracle = InvestmentOracle::new(
                vec![Asset::unit(0)
                    .with_costs(2.0, 0.0)
                    .with_installed_quantity(0.0)],
                vec![],
                factory,
                OracleOptions {
                    num_slots,
                    ..OracleOptions::default()
                },
            );

            oracle.compute(&[3.0]).unwrap();
            assert_approx_eq!(f64, oracle.value(), 5.0 + 2.0 * 3.0);
            oracle.has_linearization(true);
            assert_eq!(oracle.linearization_coefficients().unwrap(), vec![2.0]);
        }
    }

    #[test]
    fn test_diagonal_constant_subtracts_the_gradient() {
        let mut oracle = zero_cost_oracle(1, OracleOptions::default());
        oracle.assets[0] = Asset::unit(0)
            .with_costs(7.0, 0.0)
            .with_installed_quantity(1.0)
            .with_bounds(0.0, 10.0);

        oracle.compute(&[3.0]).unwrap();
        oracle.has_linearization(true);
        // F(3) = 7*(3-1) = 14, g = 7, constant = 14 - 7*3
        assert_approx_eq!(f64, oracle.linearization_constant().unwrap(), -7.0);
    }

    #[test]
    fn test_compute_linearization_can_be_disabled() {
        let mut oracle = zero_cost_oracle(1, OracleOptions::default());
        oracle.set_parameter("compute_linearization", false).unwrap();
        oracle.compute(&[1.0]).unwrap();
        assert!(oracle.value().is_finite());
        assert!(!oracle.has_linearization(true));
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let mut oracle = zero_cost_oracle(1, OracleOptions::default());
        assert!(matches!(
            oracle.set_parameter("no_such_parameter", 1i64),
            Err(Error::UnknownParameter(_))
        ));
        assert!(matches!(
            oracle.set_parameter("compute_linearization", 0.5f64),
            Err(Error::UnknownParameter(_))
        ));
        oracle.set_parameter("multiplier_tolerance", 1e-8).unwrap();
        oracle.set_parameter("output_filename", "values.log").unwrap();
        assert_eq!(oracle.options.output_filename, "values.log");
    }

    #[test]
    fn test_shrinking_the_pool_notifies_removals() {
        let mut oracle = zero_cost_oracle(1, OracleOptions {
            global_pool_size: 4,
            ..OracleOptions::default()
        });
        let receiver = oracle.subscribe_modifications();

        oracle.set_parameter("global_pool_max", 2i64).unwrap();
        assert_eq!(oracle.pool().size(), 2);
        assert_eq!(
            receiver.recv().unwrap(),
            Modification::PoolRemoved(vec![2, 3])
        );
    }

    #[test]
    fn test_remove_variables_drops_assets_and_columns() {
        let assets = vec![
            Asset::unit(0),
            Asset::unit(1),
            Asset::unit(2),
        ];
        let constraints =
            vec![LinearConstraint::less_equal(vec![1.0, 2.0, 3.0], 10.0)];
        let factory: ModelFactory =
            Box::new(|| Box::new(StubModel::new(1, 1).with_unit(UnitKind::Thermal, 1)));
        let mut oracle = InvestmentOracle::new(
            assets,
            constraints,
            factory,
            OracleOptions::default(),
        );
        let receiver = oracle.subscribe_modifications();

        oracle.remove_variables(&[1]).unwrap();
        assert_eq!(oracle.num_variables(), 2);
        assert_eq!(oracle.assets()[1].index, 2);
        assert_eq!(oracle.constraints[0].coefficients(), &[1.0, 3.0]);
        assert_eq!(
            receiver.recv().unwrap(),
            Modification::VariablesRemoved(vec![1])
        );

        assert!(matches!(
            oracle.remove_variables(&[5]),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_output_file_receives_variables_and_value() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("trace.log");

        let mut oracle = zero_cost_oracle(1, OracleOptions::default());
        oracle
            .set_parameter("output_filename", path.to_str().unwrap())
            .unwrap();
        oracle.compute(&[1.5]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("Variables: 1"));
        assert!(contents.contains("Function value: 0"));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: OracleOptions = serde_json::from_str(
            r#"{ "num_slots": 3, "replicate_battery": true }"#,
        )
        .unwrap();
        assert_eq!(options.num_slots, 3);
        assert!(options.replicate_battery);
        assert!(options.compute_linearization);
        assert_eq!(options.constraints_tolerance, 1e-6);
    }

    #[test]
    fn test_restore_state_notifies_removal_then_addition() {
        let mut oracle = zero_cost_oracle(1, OracleOptions {
            global_pool_size: 2,
            ..OracleOptions::default()
        });
        oracle.compute(&[1.0]).unwrap();
        oracle.has_linearization(true);
        oracle.store_linearization(1).unwrap();
        let snapshot = oracle.state();

        let receiver = oracle.subscribe_modifications();
        oracle.restore_state(&snapshot).unwrap();
        assert_eq!(receiver.recv().unwrap(), Modification::PoolRemoved(vec![]));
        assert_eq!(receiver.recv().unwrap(), Modification::PoolAdded(vec![1]));
        assert!(oracle.pool().is_present(1));
    }
}
