use crate::asset::{Asset, AssetKind};
use crate::error::{Error, Result};
use crate::operation::{
    BatteryData, GeneratorSeries, IntermittentData, LineSolution, Sense, StageLayout,
    StageSolution, UnitSolution,
};

/// Accumulates, over the stages of one scenario, the contribution of
/// each investment asset to the subgradient of the expected-cost
/// function.
///
/// Assets encode the investment in one of two ways. Replication assets
/// (thermal units, and batteries or intermittent units when the
/// corresponding replicate flag is set) have constraints and objective
/// linear in their scale factor; their contribution combines the duals
/// of the linking constraints with the unit's own objective at unit
/// scale. Kappa assets (batteries, intermittent units, transmission
/// lines) have internal bound constraints linear in the capacity
/// parameter; their contribution is a signed sum of the duals of those
/// constraints weighted by the bounds that multiply kappa.
pub struct LinearizationBuilder {
    coefficients: Vec<f64>,
    replicate_battery: bool,
    replicate_intermittent: bool,
}

impl LinearizationBuilder {
    pub fn new(
        num_variables: usize,
        replicate_battery: bool,
        replicate_intermittent: bool,
    ) -> Self {
        Self {
            coefficients: vec![0.0; num_variables],
            replicate_battery,
            replicate_intermittent,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn into_coefficients(self) -> Vec<f64> {
        self.coefficients
    }

    /// Adds the contribution of every asset for one solved stage. The
    /// correspondence between assets and coefficient entries is
    /// positional.
    pub fn accumulate_stage(
        &mut self,
        stage: usize,
        solution: &StageSolution,
        layout: &StageLayout,
        assets: &[Asset],
        sense: Sense,
    ) -> Result<()> {
        assert_eq!(assets.len(), self.coefficients.len());

        if !solution.dual_available {
            return Err(Error::DualUnavailable(stage));
        }

        for (variable, asset) in assets.iter().enumerate() {
            match asset.kind {
                AssetKind::Unit => {
                    let unit = solution.units.get(asset.index).ok_or_else(|| {
                        Error::OutOfRange(format!(
                            "unit block {} does not exist at stage {stage}",
                            asset.index
                        ))
                    })?;
                    self.coefficients[variable] +=
                        self.unit_contribution(asset.index, unit, solution, layout, sense)?;
                }
                AssetKind::Line => {
                    let line = solution.lines.get(asset.index).ok_or_else(|| {
                        Error::OutOfRange(format!(
                            "transmission line {} does not exist at stage {stage}",
                            asset.index
                        ))
                    })?;
                    self.coefficients[variable] += line_contribution(line, sense);
                }
            }
        }
        Ok(())
    }

    fn unit_contribution(
        &self,
        unit_index: usize,
        unit: &UnitSolution,
        solution: &StageSolution,
        layout: &StageLayout,
        sense: Sense,
    ) -> Result<f64> {
        match unit {
            UnitSolution::Thermal {
                series,
                objective_at_unit_scale,
                ..
            } => Ok(scale_contribution(
                unit_index,
                series,
                *objective_at_unit_scale,
                solution,
                layout,
            )),
            UnitSolution::Battery {
                series,
                data,
                objective_at_unit_scale,
            } => {
                if self.replicate_battery {
                    Ok(scale_contribution(
                        unit_index,
                        series,
                        *objective_at_unit_scale,
                        solution,
                        layout,
                    ))
                } else {
                    battery_kappa_contribution(data, sense)
                }
            }
            UnitSolution::Intermittent {
                series,
                data,
                objective_at_unit_scale,
            } => {
                if self.replicate_intermittent {
                    Ok(scale_contribution(
                        unit_index,
                        series,
                        *objective_at_unit_scale,
                        solution,
                        layout,
                    ))
                } else {
                    Ok(intermittent_kappa_contribution(data, sense))
                }
            }
            UnitSolution::Hydro { .. } => Err(Error::UnsupportedAssetKind(format!(
                "hydro unit block {unit_index} cannot be an investment asset"
            ))),
        }
    }
}

/// Contribution of a replication (scale factor) asset: the duals of the
/// node injection constraints against the unit's injections, the duals
/// of the reserve zone demand constraints against its reserve
/// provision, and the unit's own objective evaluated at unit scale.
fn scale_contribution(
    unit_index: usize,
    series: &GeneratorSeries,
    objective_at_unit_scale: f64,
    solution: &StageSolution,
    layout: &StageLayout,
) -> f64 {
    let mut contribution = 0.0;
    let time_horizon = series.time_horizon();
    let generator_node = &layout.generator_node[unit_index];

    for t in 0..time_horizon {
        for g in 0..series.num_generators() {
            let node = generator_node[g];
            let dual = solution.node_injection_duals[t][node];
            contribution += dual * series.active_power[g][t];

            if let (Some(fixed_consumption), Some(commitment)) =
                (&series.fixed_consumption, &series.commitment)
            {
                contribution +=
                    dual * fixed_consumption[g][t] * (1.0 - commitment[g][t]);
            }

            if let Some(reserve) = &series.primary_spinning_reserve {
                if !solution.primary_demand_duals.is_empty() {
                    for &zone in layout.node_primary_zones[node].iter() {
                        contribution +=
                            solution.primary_demand_duals[t][zone] * reserve[g][t];
                    }
                }
            }

            if let Some(reserve) = &series.secondary_spinning_reserve {
                if !solution.secondary_demand_duals.is_empty() {
                    for &zone in layout.node_secondary_zones[node].iter() {
                        contribution +=
                            solution.secondary_demand_duals[t][zone] * reserve[g][t];
                    }
                }
            }

            if !solution.inertia_demand_duals.is_empty() {
                for &zone in layout.node_inertia_zones[node].iter() {
                    let dual = solution.inertia_demand_duals[t][zone];
                    if let (Some(commitment), Some(weight)) =
                        (&series.commitment, &series.inertia_commitment)
                    {
                        contribution += dual * weight[g][t] * commitment[g][t];
                    }
                    if let Some(weight) = &series.inertia_power {
                        contribution += dual * weight[g][t] * series.active_power[g][t];
                    }
                }
            }
        }
    }

    contribution + objective_at_unit_scale
}

/// Contribution of a kappa-style intermittent unit: the duals of the
/// active-power bound constraints (side selected by the dual sign rule)
/// and of the minimum/maximum total-power constraints, weighted by the
/// power bounds that multiply kappa.
fn intermittent_kappa_contribution(data: &IntermittentData, sense: Sense) -> f64 {
    let sign = sense.dual_sign();
    let mut contribution = 0.0;

    for t in 0..data.min_power.len() {
        if let Some(duals) = &data.active_power_bound_duals {
            let dual = duals[t];
            let bound = if sign * dual > 0.0 {
                data.min_power[t]
            } else {
                data.max_power[t]
            };
            contribution += -dual * bound;
        }

        let alpha_min = data
            .min_power_duals
            .as_ref()
            .map_or(0.0, |duals| duals[t].abs());
        let alpha_max = data
            .max_power_duals
            .as_ref()
            .map_or(0.0, |duals| duals[t].abs());

        contribution +=
            data.min_power[t] * alpha_min - data.max_power[t] * data.gamma * alpha_max;
    }

    contribution
}

/// Contribution of a kappa-style battery unit: power output, intake,
/// storage and reserve bound duals, each weighted by the bound that
/// multiplies kappa in its constraint; the binary-dependent intake and
/// outtake terms add `u_t` and `(1 - u_t)` weights respectively.
fn battery_kappa_contribution(data: &BatteryData, sense: Sense) -> Result<f64> {
    if data.outtake_bound_duals.is_some() {
        // the kappa rule for outtake-level bounds is not defined
        return Err(Error::UnsupportedAssetKind(
            "battery unit with outtake-level bounds".to_string(),
        ));
    }

    let sign = sense.dual_sign();
    let mut contribution = 0.0;

    for t in 0..data.min_power.len() {
        let lambda_min = data.min_power_duals[t].abs();
        let lambda_max = data.max_power_duals[t].abs();
        contribution += data.min_power[t] * lambda_min - data.max_power[t] * lambda_max;

        if let Some(duals) = &data.intake_bound_duals {
            let dual = duals[t];
            let bound = if sign * dual < 0.0 {
                data.max_power[t]
            } else {
                0.0
            };
            contribution += -dual * bound;
        }

        if let (Some(duals), Some(u)) =
            (&data.max_intake_binary_duals, &data.intake_outtake_binary)
        {
            let alpha = duals[t].abs();
            contribution += -alpha * u[t] * data.max_power[t];
        }

        if let (Some(duals), Some(u)) =
            (&data.max_outtake_binary_duals, &data.intake_outtake_binary)
        {
            let alpha = duals[t].abs();
            contribution += (1.0 - u[t]) * alpha * data.min_power[t];
        }

        let dual = data.storage_level_bound_duals[t];
        let bound = if sign * dual > 0.0 {
            data.min_storage[t]
        } else {
            data.max_storage[t]
        };
        contribution += -dual * bound;

        if let Some(duals) = &data.primary_reserve_bound_duals {
            contribution += -data.max_primary_power[t] * duals[t].abs();
        }

        if let Some(duals) = &data.secondary_reserve_bound_duals {
            contribution += -data.max_secondary_power[t] * duals[t].abs();
        }
    }

    Ok(contribution)
}

/// Contribution of a transmission line: `-dual * bound` per time step,
/// where the flow bound is selected by the dual sign rule.
fn line_contribution(line: &LineSolution, sense: Sense) -> f64 {
    let sign = sense.dual_sign();
    let mut contribution = 0.0;
    for &dual in line.flow_limit_duals.iter() {
        let bound = if sign * dual > 0.0 {
            line.min_flow
        } else {
            line.max_flow
        };
        contribution += -dual * bound;
    }
    contribution
}
