use crate::error::{Error, Result};
use crate::operation::{
    OperationalModel, StageSolution, UnitInitialState, UnitKind, UnitNode, UnitSolution,
};
use std::collections::VecDeque;

/// Transfers terminal physical state between consecutive stages of a
/// single scenario trajectory: hydro flow rates, battery power and
/// storage, thermal initial power and, in single-trace mode, the thermal
/// up/down run length.
pub struct StateBridge {
    propagate_runlength: bool,
}

impl StateBridge {
    /// In single-trace (greedy simulation) mode the thermal initial
    /// up/down time is recomputed by walking the commitment history
    /// backward; otherwise only the initial power is propagated and the
    /// run length configured in the model is preserved.
    pub fn new(propagate_runlength: bool) -> Self {
        Self {
            propagate_runlength,
        }
    }

    /// Imprints the subproblem of `stage` with the terminal state of the
    /// solved stages recorded in `trace` (`trace[s]` is the solution of
    /// stage `s`; stages `0..stage` must be present).
    pub fn carry(
        &self,
        model: &mut dyn OperationalModel,
        trace: &[StageSolution],
        stage: usize,
    ) -> Result<()> {
        assert!(
            stage >= 1 && trace.len() >= stage,
            "stages 0..{stage} must be solved"
        );

        let previous_topology = model.stage_topology(stage - 1).to_vec();
        let topology = model.stage_topology(stage).to_vec();
        let transfers =
            self.plan_transfers(&previous_topology, &topology, trace, stage)?;

        for (unit, state) in transfers {
            model.set_initial_state(stage, unit, state);
        }
        Ok(())
    }

    /// Walks the two block trees pairwise breadth-first, checking that
    /// they have the same shape and collecting one state transfer per
    /// matched pair of units.
    fn plan_transfers(
        &self,
        previous_topology: &[UnitNode],
        topology: &[UnitNode],
        trace: &[StageSolution],
        stage: usize,
    ) -> Result<Vec<(usize, UnitInitialState)>> {
        let mismatch = |details: String| Error::StructureMismatch {
            previous_stage: stage - 1,
            stage,
            details,
        };

        if previous_topology.len() != topology.len() {
            return Err(mismatch(format!(
                "{} != {} top-level blocks",
                previous_topology.len(),
                topology.len()
            )));
        }

        let mut transfers = vec![];
        let mut queue: VecDeque<(&UnitNode, &UnitNode)> =
            previous_topology.iter().zip(topology.iter()).collect();

        while let Some((previous, current)) = queue.pop_front() {
            if previous.kind != current.kind {
                return Err(mismatch(format!(
                    "{:?} block paired with a {:?} block",
                    previous.kind, current.kind
                )));
            }
            if previous.children.len() != current.children.len() {
                return Err(mismatch(format!(
                    "{} != {} nested blocks",
                    previous.children.len(),
                    current.children.len()
                )));
            }
            queue.extend(previous.children.iter().zip(current.children.iter()));

            let (Some(previous_unit), Some(unit)) = (previous.unit, current.unit)
            else {
                continue;
            };
            let solution = &trace[stage - 1].units[previous_unit];
            if let Some(state) =
                self.unit_state(solution, previous_unit, previous, current, trace, stage)?
            {
                transfers.push((unit, state));
            }
        }

        Ok(transfers)
    }

    fn unit_state(
        &self,
        solution: &UnitSolution,
        unit_index: usize,
        previous: &UnitNode,
        current: &UnitNode,
        trace: &[StageSolution],
        stage: usize,
    ) -> Result<Option<UnitInitialState>> {
        match solution {
            UnitSolution::Hydro { series, flow_rate } => {
                if previous.generators != current.generators {
                    return Err(Error::StructureMismatch {
                        previous_stage: stage - 1,
                        stage,
                        details: format!(
                            "hydro block has {} generators, its successor has {}",
                            previous.generators, current.generators
                        ),
                    });
                }
                let last = series.time_horizon() - 1;
                let flow_rate = flow_rate.iter().map(|series| series[last]).collect();
                Ok(Some(UnitInitialState::Hydro { flow_rate }))
            }
            UnitSolution::Battery { series, data, .. } => {
                let last = series.time_horizon() - 1;
                Ok(Some(UnitInitialState::Battery {
                    power: series.active_power[0][last],
                    storage: data.storage_level[last],
                }))
            }
            UnitSolution::Thermal { series, .. } => {
                let last = series.time_horizon() - 1;
                let up_down_time = if self.propagate_runlength {
                    compute_init_up_down_time(trace, stage, unit_index)
                } else {
                    None
                };
                Ok(Some(UnitInitialState::Thermal {
                    power: series.active_power[0][last],
                    up_down_time,
                }))
            }
            UnitSolution::Intermittent { .. } => Ok(None),
        }
    }
}

/// Computes the signed initial up/down time of a thermal unit at the
/// start of `stage` by walking the recorded commitments backward through
/// the solved stages, counting consecutive steps of the same polarity
/// and stopping at the first polarity change or at a recorded shutdown.
/// Returns `None` when the trace carries no commitment data for the
/// unit.
fn compute_init_up_down_time(
    trace: &[StageSolution],
    stage: usize,
    unit: usize,
) -> Option<i64> {
    let thermal = |s: usize| -> Option<(&Vec<Vec<f64>>, Option<&Vec<f64>>)> {
        match &trace[s].units[unit] {
            UnitSolution::Thermal {
                series, shutdown, ..
            } => series
                .commitment
                .as_ref()
                .map(|commitment| (commitment, shutdown.as_ref())),
            _ => None,
        }
    };

    let (commitment, shutdown) = thermal(stage - 1)?;
    let last = commitment[0].len() - 1;
    if let Some(shutdown) = shutdown {
        if shutdown[last] >= 0.5 {
            return Some(0);
        }
    }

    let on = commitment[0][last] >= 0.5;
    let mut count: i64 = if on { 1 } else { -1 };

    let mut series = &commitment[0];
    for s in (0..stage).rev() {
        for t in (1..series.len()).rev() {
            if (series[t] - series[t - 1]).abs() > 0.5 {
                return Some(count);
            }
            count += if on { 1 } else { -1 };
        }

        if s == 0 {
            break;
        }

        // bridge into the last step of the stage before
        let Some((previous, _)) = thermal(s - 1) else {
            break;
        };
        let previous_last = *previous[0].last().unwrap();
        let same_polarity = (previous_last >= 0.5) == on;
        if !same_polarity {
            break;
        }
        count += if on { 1 } else { -1 };
        series = &previous[0];
    }

    Some(count)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::fixture::StubModel;
    use crate::operation::{BatteryData, GeneratorSeries};

    fn thermal_solution(commitment: Vec<f64>, shutdown: Option<Vec<f64>>) -> UnitSolution {
        let horizon = commitment.len();
        UnitSolution::Thermal {
            series: GeneratorSeries {
                active_power: vec![vec![10.0; horizon]],
                commitment: Some(vec![commitment]),
                ..GeneratorSeries::default()
            },
            shutdown,
            objective_at_unit_scale: 0.0,
        }
    }

    fn stage_with(units: Vec<UnitSolution>) -> StageSolution {
        StageSolution {
            units,
            dual_available: true,
            ..StageSolution::default()
        }
    }

    #[test]
    fn test_hydro_flow_rate_is_carried_from_last_time_step() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Hydro, 2);
        let trace = vec![stage_with(vec![UnitSolution::Hydro {
            series: GeneratorSeries::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]]),
            flow_rate: vec![vec![5.0, 6.0], vec![7.0, 8.0]],
        }])];

        StateBridge::new(false).carry(&mut model, &trace, 1).unwrap();

        assert_eq!(
            model.initial_states(),
            &[(
                1,
                0,
                UnitInitialState::Hydro {
                    flow_rate: vec![6.0, 8.0]
                }
            )]
        );
    }

    #[test]
    fn test_battery_power_and_storage_are_carried() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Battery, 1);
        let trace = vec![stage_with(vec![UnitSolution::Battery {
            series: GeneratorSeries::new(vec![vec![1.0, -2.5]]),
            data: BatteryData {
                storage_level: vec![40.0, 35.5],
                ..BatteryData::default()
            },
            objective_at_unit_scale: 0.0,
        }])];

        StateBridge::new(false).carry(&mut model, &trace, 1).unwrap();

        assert_eq!(
            model.initial_states(),
            &[(
                1,
                0,
                UnitInitialState::Battery {
                    power: -2.5,
                    storage: 35.5
                }
            )]
        );
    }

    #[test]
    fn test_thermal_runlength_disabled_in_multi_scenario_mode() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Thermal, 1);
        let trace = vec![stage_with(vec![thermal_solution(vec![1.0, 1.0], None)])];

        StateBridge::new(false).carry(&mut model, &trace, 1).unwrap();

        assert_eq!(
            model.initial_states(),
            &[(
                1,
                0,
                UnitInitialState::Thermal {
                    power: 10.0,
                    up_down_time: None
                }
            )]
        );
    }

    #[test]
    fn test_thermal_runlength_counts_across_stage_boundaries() {
        // two solved stages of three steps each, all committed
        let trace = vec![
            stage_with(vec![thermal_solution(vec![1.0, 1.0, 1.0], None)]),
            stage_with(vec![thermal_solution(vec![1.0, 1.0, 1.0], None)]),
        ];
        assert_eq!(compute_init_up_down_time(&trace, 2, 0), Some(6));
    }

    #[test]
    fn test_thermal_runlength_stops_at_polarity_change() {
        let trace = vec![
            stage_with(vec![thermal_solution(vec![1.0, 1.0, 1.0], None)]),
            stage_with(vec![thermal_solution(vec![0.0, 1.0, 1.0], None)]),
        ];
        assert_eq!(compute_init_up_down_time(&trace, 2, 0), Some(2));
    }

    #[test]
    fn test_thermal_runlength_counts_down_time() {
        let trace =
            vec![stage_with(vec![thermal_solution(vec![1.0, 0.0, 0.0], None)])];
        assert_eq!(compute_init_up_down_time(&trace, 1, 0), Some(-2));
    }

    #[test]
    fn test_thermal_runlength_zero_after_shutdown() {
        let trace = vec![stage_with(vec![thermal_solution(
            vec![1.0, 1.0, 1.0],
            Some(vec![0.0, 0.0, 1.0]),
        )])];
        assert_eq!(compute_init_up_down_time(&trace, 1, 0), Some(0));
    }

    #[test]
    fn test_thermal_without_commitment_data_is_left_alone() {
        let trace = vec![stage_with(vec![UnitSolution::Thermal {
            series: GeneratorSeries::new(vec![vec![10.0, 20.0]]),
            shutdown: None,
            objective_at_unit_scale: 0.0,
        }])];
        assert_eq!(compute_init_up_down_time(&trace, 1, 0), None);

        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Thermal, 1);
        StateBridge::new(true).carry(&mut model, &trace, 1).unwrap();
        assert_eq!(
            model.initial_states(),
            &[(
                1,
                0,
                UnitInitialState::Thermal {
                    power: 20.0,
                    up_down_time: None
                }
            )]
        );
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Thermal, 1);
        model.replace_stage_topology(0, vec![UnitNode::new(UnitKind::Battery, 1, 0)]);
        let trace = vec![stage_with(vec![thermal_solution(vec![1.0], None)])];

        let result = StateBridge::new(false).carry(&mut model, &trace, 1);
        assert!(matches!(result, Err(Error::StructureMismatch { .. })));
    }

    #[test]
    fn test_nested_count_mismatch_is_fatal() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Thermal, 1);
        model.replace_stage_topology(
            0,
            vec![UnitNode::new(UnitKind::Thermal, 1, 0)
                .with_children(vec![UnitNode::new(UnitKind::Hydro, 1, 1)])],
        );
        let trace = vec![stage_with(vec![thermal_solution(vec![1.0], None)])];

        let result = StateBridge::new(false).carry(&mut model, &trace, 1);
        assert!(matches!(result, Err(Error::StructureMismatch { .. })));
    }

    #[test]
    fn test_hydro_generator_count_mismatch_is_fatal() {
        let mut model = StubModel::new(2, 1).with_unit(UnitKind::Hydro, 1);
        model.replace_stage_topology(0, vec![UnitNode::new(UnitKind::Hydro, 2, 0)]);
        let trace = vec![stage_with(vec![UnitSolution::Hydro {
            series: GeneratorSeries::new(vec![vec![0.0], vec![0.0]]),
            flow_rate: vec![vec![1.0], vec![2.0]],
        }])];

        let result = StateBridge::new(false).carry(&mut model, &trace, 1);
        assert!(matches!(result, Err(Error::StructureMismatch { .. })));
    }
}
