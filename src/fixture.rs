//! Fixtures for tests: a deterministic stand-in for the nested
//! operational model, recording every parameterization the oracle
//! applies to it and returning pre-built stage views.

use crate::operation::{
    BatteryData, GeneratorSeries, IntermittentData, LineSolution, OperationalModel,
    Sense, SolverStatus, StageLayout, StageSolution, UnitInitialState, UnitKind,
    UnitNode, UnitSolution,
};
use std::sync::{Arc, Mutex};

/// Everything a [`StubModel`] was asked to do, shared across evaluator
/// slots so that tests can assert on it after a compute.
#[derive(Debug, Default)]
pub struct Recorder {
    pub scales: Vec<(usize, f64)>,
    pub kappas: Vec<(usize, f64)>,
    pub line_kappas: Vec<(Vec<usize>, Vec<f64>)>,
    pub states: Vec<(usize, usize, UnitInitialState)>,
    pub solves: Vec<(usize, usize)>,
}

/// A configurable operational model whose stage solves return pre-built
/// views. One time step per stage by default.
pub struct StubModel {
    num_stages: usize,
    num_scenarios: usize,
    sense: Sense,
    topologies: Vec<Vec<UnitNode>>,
    layouts: Vec<StageLayout>,
    templates: Vec<StageSolution>,
    solutions: Vec<Option<StageSolution>>,
    failure: Option<(usize, usize, SolverStatus)>,
    recorder: Option<Arc<Mutex<Recorder>>>,
    initial_states: Vec<(usize, usize, UnitInitialState)>,
    applied_scales: Vec<(usize, f64)>,
    applied_kappas: Vec<(usize, f64)>,
}

impl StubModel {
    pub fn new(num_stages: usize, num_scenarios: usize) -> Self {
        let template = StageSolution {
            node_injection_duals: vec![vec![0.0]],
            dual_available: true,
            ..StageSolution::default()
        };
        Self {
            num_stages,
            num_scenarios,
            sense: Sense::Minimise,
            topologies: vec![vec![]; num_stages],
            layouts: vec![StageLayout::single_node(&[]); num_stages],
            templates: vec![template; num_stages],
            solutions: vec![None; num_stages],
            failure: None,
            recorder: None,
            initial_states: vec![],
            applied_scales: vec![],
            applied_kappas: vec![],
        }
    }

    /// Appends one unit of the given kind to every stage, with zeroed
    /// primal and dual views over a single time step.
    pub fn with_unit(mut self, kind: UnitKind, generators: usize) -> Self {
        let unit = self.templates[0].units.len();
        for stage in 0..self.num_stages {
            self.topologies[stage].push(UnitNode::new(kind, generators, unit));
            self.templates[stage].units.push(zero_unit(kind, generators));
        }
        let counts: Vec<usize> = self.topologies[0]
            .iter()
            .map(|node| node.generators)
            .collect();
        self.layouts = vec![StageLayout::single_node(&counts); self.num_stages];
        self
    }

    /// Appends one transmission line to every stage, with the given
    /// flow bounds and a zeroed flow-limit dual over a single time
    /// step.
    pub fn with_line(mut self, min_flow: f64, max_flow: f64) -> Self {
        for template in self.templates.iter_mut() {
            template.lines.push(LineSolution {
                min_flow,
                max_flow,
                flow_limit_duals: vec![0.0],
            });
        }
        self
    }

    /// Sets the objective value every stage solve reports.
    pub fn with_objective(mut self, objective: f64) -> Self {
        for template in self.templates.iter_mut() {
            template.objective = objective;
        }
        self
    }

    pub fn with_sense(mut self, sense: Sense) -> Self {
        self.sense = sense;
        self
    }

    /// Replaces the views returned by solves of the given stage.
    pub fn with_stage_template(mut self, stage: usize, template: StageSolution) -> Self {
        self.templates[stage] = template;
        self
    }

    /// Makes the solve of the given (scenario, stage) pair return the
    /// given status with no solution attached.
    pub fn with_failure(
        mut self,
        scenario: usize,
        stage: usize,
        status: SolverStatus,
    ) -> Self {
        self.failure = Some((scenario, stage, status));
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<Mutex<Recorder>>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn replace_stage_topology(&mut self, stage: usize, topology: Vec<UnitNode>) {
        self.topologies[stage] = topology;
    }

    pub fn initial_states(&self) -> &[(usize, usize, UnitInitialState)] {
        &self.initial_states
    }

    pub fn applied_scales(&self) -> &[(usize, f64)] {
        &self.applied_scales
    }

    pub fn applied_kappas(&self) -> &[(usize, f64)] {
        &self.applied_kappas
    }

    fn record<F: FnOnce(&mut Recorder)>(&self, action: F) {
        if let Some(recorder) = &self.recorder {
            action(&mut recorder.lock().unwrap());
        }
    }
}

fn zero_unit(kind: UnitKind, generators: usize) -> UnitSolution {
    let series = GeneratorSeries::new(vec![vec![0.0]; generators]);
    match kind {
        UnitKind::Thermal => UnitSolution::Thermal {
            series,
            shutdown: None,
            objective_at_unit_scale: 0.0,
        },
        UnitKind::Hydro => UnitSolution::Hydro {
            series,
            flow_rate: vec![vec![0.0]; generators],
        },
        UnitKind::Battery => UnitSolution::Battery {
            series,
            data: BatteryData {
                min_power: vec![0.0],
                max_power: vec![0.0],
                min_storage: vec![0.0],
                max_storage: vec![0.0],
                max_primary_power: vec![0.0],
                max_secondary_power: vec![0.0],
                storage_level: vec![0.0],
                min_power_duals: vec![0.0],
                max_power_duals: vec![0.0],
                storage_level_bound_duals: vec![0.0],
                ..BatteryData::default()
            },
            objective_at_unit_scale: 0.0,
        },
        UnitKind::Intermittent => UnitSolution::Intermittent {
            series,
            data: IntermittentData {
                min_power: vec![0.0],
                max_power: vec![0.0],
                gamma: 1.0,
                ..IntermittentData::default()
            },
            objective_at_unit_scale: 0.0,
        },
    }
}

impl OperationalModel for StubModel {
    fn num_stages(&self) -> usize {
        self.num_stages
    }

    fn num_scenarios(&self) -> usize {
        self.num_scenarios
    }

    fn objective_sense(&self) -> Sense {
        self.sense
    }

    fn stage_topology(&self, stage: usize) -> &[UnitNode] {
        &self.topologies[stage]
    }

    fn stage_layout(&self, stage: usize) -> &StageLayout {
        &self.layouts[stage]
    }

    fn apply_unit_scale(&mut self, unit: usize, value: f64) {
        self.applied_scales.push((unit, value));
        self.record(|recorder| recorder.scales.push((unit, value)));
    }

    fn apply_unit_kappa(&mut self, unit: usize, value: f64) {
        self.applied_kappas.push((unit, value));
        self.record(|recorder| recorder.kappas.push((unit, value)));
    }

    fn apply_line_kappa(&mut self, lines: &[usize], values: &[f64]) {
        self.record(|recorder| {
            recorder
                .line_kappas
                .push((lines.to_vec(), values.to_vec()));
        });
    }

    fn set_initial_state(&mut self, stage: usize, unit: usize, state: UnitInitialState) {
        self.initial_states.push((stage, unit, state.clone()));
        self.record(|recorder| recorder.states.push((stage, unit, state)));
    }

    fn solve_stage(&mut self, scenario: usize, stage: usize) -> SolverStatus {
        self.record(|recorder| recorder.solves.push((scenario, stage)));
        if let Some((fail_scenario, fail_stage, status)) = self.failure {
            if fail_scenario == scenario && fail_stage == stage {
                self.solutions[stage] = None;
                return status;
            }
        }
        self.solutions[stage] = Some(self.templates[stage].clone());
        SolverStatus::Ok
    }

    fn stage_solution(&self, stage: usize) -> Option<&StageSolution> {
        self.solutions[stage].as_ref()
    }
}
