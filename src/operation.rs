//! The contract between the investment oracle and the nested operational
//! model. One [`OperationalModel`] is an independent copy of the whole
//! multi-stage unit-commitment chain; the oracle owns several identical
//! copies (evaluator slots) and drives each of them through a greedy
//! stage-by-stage solve per scenario, reading back the primal and dual
//! views it needs to build linearizations.

/// Whether the objective of the operational model is minimized or
/// maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Minimise,
    Maximise,
}

impl Sense {
    /// The worst possible value of the objective under this sense.
    pub fn worst_value(&self) -> f64 {
        match self {
            Sense::Minimise => f64::INFINITY,
            Sense::Maximise => f64::NEG_INFINITY,
        }
    }

    /// Sign used to decide which side of a two-sided constraint a dual
    /// value belongs to: under this sense, a dual `d` belongs to the
    /// lower side iff `dual_sign() * d > 0`.
    pub fn dual_sign(&self) -> f64 {
        match self {
            Sense::Minimise => -1.0,
            Sense::Maximise => 1.0,
        }
    }
}

/// The kinds of results of solving one operational subproblem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// An optimal solution was found
    Ok,
    /// An error occurred inside the solver
    Error,
    /// The subproblem chain is infeasible
    Infeasible,
    /// The subproblem is unbounded
    Unbounded,
    /// A feasible solution was found, then a time limit was hit
    StopTime,
    /// A feasible solution was found, then an iteration limit was hit
    StopIter,
    /// A feasible solution of low precision was found
    LowPrecision,
    /// Some stage subproblem is infeasible
    SubproblemInfeasible,
    /// No solution was found
    SolutionNotFound,
}

impl SolverStatus {
    /// True iff a primal solution is available despite the status not
    /// necessarily being [`SolverStatus::Ok`].
    pub fn has_solution(&self) -> bool {
        matches!(
            self,
            SolverStatus::Ok
                | SolverStatus::StopTime
                | SolverStatus::StopIter
                | SolverStatus::LowPrecision
        )
    }
}

/// The unit kinds the engine knows how to invest in and to chain across
/// stages. A closed set: adding a kind requires registering both its
/// linearization rule and its inter-stage state transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Thermal,
    Hydro,
    Battery,
    Intermittent,
}

/// One node of the block tree of a stage model. `unit` indexes into the
/// unit list of the stage's [`StageSolution`]; purely structural nodes
/// carry `None`.
#[derive(Debug, Clone)]
pub struct UnitNode {
    pub kind: UnitKind,
    pub generators: usize,
    pub unit: Option<usize>,
    pub children: Vec<UnitNode>,
}

impl UnitNode {
    pub fn new(kind: UnitKind, generators: usize, unit: usize) -> Self {
        Self {
            kind,
            generators,
            unit: Some(unit),
            children: vec![],
        }
    }

    pub fn with_children(mut self, children: Vec<UnitNode>) -> Self {
        self.children = children;
        self
    }
}

/// Per-generator time series of a solved unit, shared by every unit
/// kind. `active_power[g][t]` is always present; the other series are
/// optional views that a model may not expose.
#[derive(Debug, Clone, Default)]
pub struct GeneratorSeries {
    pub active_power: Vec<Vec<f64>>,
    pub commitment: Option<Vec<Vec<f64>>>,
    pub fixed_consumption: Option<Vec<Vec<f64>>>,
    pub primary_spinning_reserve: Option<Vec<Vec<f64>>>,
    pub secondary_spinning_reserve: Option<Vec<Vec<f64>>>,
    pub inertia_commitment: Option<Vec<Vec<f64>>>,
    pub inertia_power: Option<Vec<Vec<f64>>>,
}

impl GeneratorSeries {
    pub fn new(active_power: Vec<Vec<f64>>) -> Self {
        Self {
            active_power,
            ..Self::default()
        }
    }

    pub fn num_generators(&self) -> usize {
        self.active_power.len()
    }

    pub fn time_horizon(&self) -> usize {
        self.active_power.first().map_or(0, |series| series.len())
    }
}

/// Bounds and dual views of the kappa-bearing constraints of an
/// intermittent unit.
#[derive(Debug, Clone, Default)]
pub struct IntermittentData {
    pub min_power: Vec<f64>,
    pub max_power: Vec<f64>,
    pub gamma: f64,
    pub active_power_bound_duals: Option<Vec<f64>>,
    pub min_power_duals: Option<Vec<f64>>,
    pub max_power_duals: Option<Vec<f64>>,
}

/// Bounds, storage trajectory and dual views of the kappa-bearing
/// constraints of a battery unit.
#[derive(Debug, Clone, Default)]
pub struct BatteryData {
    pub min_power: Vec<f64>,
    pub max_power: Vec<f64>,
    pub min_storage: Vec<f64>,
    pub max_storage: Vec<f64>,
    pub max_primary_power: Vec<f64>,
    pub max_secondary_power: Vec<f64>,
    pub storage_level: Vec<f64>,
    pub intake_outtake_binary: Option<Vec<f64>>,
    pub min_power_duals: Vec<f64>,
    pub max_power_duals: Vec<f64>,
    pub intake_bound_duals: Option<Vec<f64>>,
    pub outtake_bound_duals: Option<Vec<f64>>,
    pub max_intake_binary_duals: Option<Vec<f64>>,
    pub max_outtake_binary_duals: Option<Vec<f64>>,
    pub storage_level_bound_duals: Vec<f64>,
    pub primary_reserve_bound_duals: Option<Vec<f64>>,
    pub secondary_reserve_bound_duals: Option<Vec<f64>>,
}

/// The solved views of one unit inside a stage model. The
/// `objective_at_unit_scale` fields carry the unit's own objective value
/// evaluated as if its scale factor were one.
#[derive(Debug, Clone)]
pub enum UnitSolution {
    Thermal {
        series: GeneratorSeries,
        shutdown: Option<Vec<f64>>,
        objective_at_unit_scale: f64,
    },
    Hydro {
        series: GeneratorSeries,
        flow_rate: Vec<Vec<f64>>,
    },
    Battery {
        series: GeneratorSeries,
        data: BatteryData,
        objective_at_unit_scale: f64,
    },
    Intermittent {
        series: GeneratorSeries,
        data: IntermittentData,
        objective_at_unit_scale: f64,
    },
}

impl UnitSolution {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitSolution::Thermal { .. } => UnitKind::Thermal,
            UnitSolution::Hydro { .. } => UnitKind::Hydro,
            UnitSolution::Battery { .. } => UnitKind::Battery,
            UnitSolution::Intermittent { .. } => UnitKind::Intermittent,
        }
    }

    pub fn series(&self) -> &GeneratorSeries {
        match self {
            UnitSolution::Thermal { series, .. } => series,
            UnitSolution::Hydro { series, .. } => series,
            UnitSolution::Battery { series, .. } => series,
            UnitSolution::Intermittent { series, .. } => series,
        }
    }
}

/// Flow bounds and flow-limit duals of one transmission line over the
/// stage's time horizon.
#[derive(Debug, Clone, Default)]
pub struct LineSolution {
    pub min_flow: f64,
    pub max_flow: f64,
    pub flow_limit_duals: Vec<f64>,
}

/// Primal and dual views of one solved stage subproblem.
#[derive(Debug, Clone, Default)]
pub struct StageSolution {
    pub objective: f64,
    pub units: Vec<UnitSolution>,
    pub lines: Vec<LineSolution>,
    /// Duals of the node injection (linking) constraints, `[t][node]`.
    pub node_injection_duals: Vec<Vec<f64>>,
    /// Duals of the reserve zone demand constraints, `[t][zone]`; empty
    /// when the model has no such zone.
    pub primary_demand_duals: Vec<Vec<f64>>,
    pub secondary_demand_duals: Vec<Vec<f64>>,
    pub inertia_demand_duals: Vec<Vec<f64>>,
    /// Whether the dual views above were actually populated by the
    /// solver.
    pub dual_available: bool,
}

/// Static layout of a stage model: which node each generator injects
/// into, and which reserve zones each node belongs to. A node may be a
/// member of several zones of the same kind at once; every one of them
/// collects the node's reserve contribution.
#[derive(Debug, Clone, Default)]
pub struct StageLayout {
    /// `generator_node[unit][g]` is the node of generator `g` of `unit`.
    pub generator_node: Vec<Vec<usize>>,
    /// `node_primary_zones[node]` lists the primary reserve zones the
    /// node belongs to; likewise for the secondary and inertia zones.
    pub node_primary_zones: Vec<Vec<usize>>,
    pub node_secondary_zones: Vec<Vec<usize>>,
    pub node_inertia_zones: Vec<Vec<usize>>,
}

impl StageLayout {
    /// A single-node layout, with every generator of every unit on node
    /// zero and no reserve zones. `generators_per_unit[u]` gives the
    /// generator count of unit `u`.
    pub fn single_node(generators_per_unit: &[usize]) -> Self {
        Self {
            generator_node: generators_per_unit
                .iter()
                .map(|&count| vec![0; count])
                .collect(),
            node_primary_zones: vec![vec![]],
            node_secondary_zones: vec![vec![]],
            node_inertia_zones: vec![vec![]],
        }
    }
}

/// Terminal state carried from a solved stage into the next one.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitInitialState {
    Hydro {
        flow_rate: Vec<f64>,
    },
    Battery {
        power: f64,
        storage: f64,
    },
    Thermal {
        power: f64,
        /// Signed run length: positive for consecutive committed steps,
        /// negative for consecutive uncommitted ones. `None` preserves
        /// the run length currently configured in the model.
        up_down_time: Option<i64>,
    },
}

/// An independent copy of the nested operational model attached to one
/// evaluator slot.
///
/// Implementations wrap whatever solves the per-stage unit-commitment
/// subproblems; the oracle only relies on this surface: parameterizing
/// the model by the investment point, imprinting inter-stage state,
/// solving one stage of one scenario, and reading the solved views back.
pub trait OperationalModel: Send {
    fn num_stages(&self) -> usize;

    fn num_scenarios(&self) -> usize;

    fn objective_sense(&self) -> Sense;

    /// The block tree of the given stage. Trees of consecutive stages
    /// must have identical shapes for state propagation to be possible.
    fn stage_topology(&self, stage: usize) -> &[UnitNode];

    fn stage_layout(&self, stage: usize) -> &StageLayout;

    /// Replicates the given unit by a scale factor on every stage.
    fn apply_unit_scale(&mut self, unit: usize, value: f64);

    /// Sets the capacity parameter (kappa) of the given unit on every
    /// stage.
    fn apply_unit_kappa(&mut self, unit: usize, value: f64);

    /// Sets the capacity parameters of the given transmission lines on
    /// every network block of every stage.
    fn apply_line_kappa(&mut self, lines: &[usize], values: &[f64]);

    /// Imprints the initial physical state of one unit of the given
    /// stage subproblem.
    fn set_initial_state(&mut self, stage: usize, unit: usize, state: UnitInitialState);

    /// Solves the subproblem of the given stage under the given
    /// scenario.
    fn solve_stage(&mut self, scenario: usize, stage: usize) -> SolverStatus;

    /// The views of the most recent solve of the given stage, or `None`
    /// if the stage has not been solved.
    fn stage_solution(&self, stage: usize) -> Option<&StageSolution>;
}
