use crate::asset::Asset;
use crate::error::Result;
use crate::oracle::{InvestmentOracle, OracleStatus};

const DEFAULT_FEASIBILITY_TOLERANCE: f64 = 1e-8;

/// One two-sided bound constraint on a single decision variable, as
/// generated from the asset bounds.
#[derive(Debug, Clone)]
pub struct BoundConstraint {
    pub lower: f64,
    pub upper: f64,
    pub relaxed: bool,
}

/// The outer investment problem: minimize `F(x) + linear cost` subject
/// to bounds on x (possibly reformulated to nonnegative shifted
/// variables) and to the linear side constraints held by the oracle.
///
/// The problem owns the decision vector; the master solver writes it
/// and [`InvestmentProblem::evaluate`] hands it to the oracle.
pub struct InvestmentProblem {
    x: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    bound_constraints: Vec<BoundConstraint>,
    reformulated: bool,
    oracle: InvestmentOracle,
}

impl InvestmentProblem {
    /// Builds the problem around an oracle; the variable bounds come
    /// from the oracle's assets and the decision vector starts at zero.
    pub fn new(oracle: InvestmentOracle) -> Self {
        let lower: Vec<f64> = oracle
            .assets()
            .iter()
            .map(|asset| asset.lower_bound)
            .collect();
        let upper: Vec<f64> = oracle
            .assets()
            .iter()
            .map(|asset| asset.upper_bound)
            .collect();
        Self {
            x: vec![0.0; oracle.num_variables()],
            lower,
            upper,
            bound_constraints: vec![],
            reformulated: false,
            oracle,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.x.len()
    }

    pub fn assets(&self) -> &[Asset] {
        self.oracle.assets()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn set_x(&mut self, values: &[f64]) {
        assert_eq!(values.len(), self.x.len());
        self.x.copy_from_slice(values);
    }

    pub fn set_variable(&mut self, i: usize, value: f64) {
        self.x[i] = value;
    }

    pub fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    pub fn is_reformulated(&self) -> bool {
        self.reformulated
    }

    pub fn oracle(&self) -> &InvestmentOracle {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut InvestmentOracle {
        &mut self.oracle
    }

    /// Generates one two-sided bound constraint per variable. Under
    /// reformulation, a variable with finite lower bound `l` gets the
    /// bounds `[0, u - l]` and the oracle is told to translate external
    /// reads accordingly.
    pub fn generate_bound_constraints(&mut self, reformulated: bool) {
        self.reformulated = reformulated;
        self.bound_constraints = (0..self.x.len())
            .map(|i| {
                if reformulated && self.lower[i].is_finite() {
                    BoundConstraint {
                        lower: 0.0,
                        upper: self.upper[i] - self.lower[i],
                        relaxed: false,
                    }
                } else {
                    BoundConstraint {
                        lower: self.lower[i],
                        upper: self.upper[i],
                        relaxed: false,
                    }
                }
            })
            .collect();
        self.oracle.set_reformulated_bounds(reformulated);
    }

    pub fn bound_constraints(&self) -> &[BoundConstraint] {
        &self.bound_constraints
    }

    pub fn relax_bound_constraint(&mut self, i: usize, relaxed: bool) {
        self.bound_constraints[i].relaxed = relaxed;
    }

    /// Whether the current point satisfies the variable bounds. With
    /// `use_abstract` and generated constraints, each non-relaxed bound
    /// constraint is checked with absolute tolerance; otherwise the
    /// natural bounds are tested directly.
    pub fn is_feasible(&self, tolerance: Option<f64>, use_abstract: bool) -> bool {
        let tolerance = tolerance.unwrap_or(DEFAULT_FEASIBILITY_TOLERANCE);

        if use_abstract && !self.bound_constraints.is_empty() {
            return self
                .bound_constraints
                .iter()
                .zip(self.x.iter())
                .filter(|(constraint, _)| !constraint.relaxed)
                .all(|(constraint, &value)| {
                    let violation = f64::max(
                        constraint.lower - value,
                        value - constraint.upper,
                    );
                    violation <= tolerance
                });
        }

        for i in 0..self.x.len() {
            if self.lower[i].is_finite() && self.x[i] < self.lower[i] - tolerance {
                return false;
            }
            if self.upper[i].is_finite() && self.x[i] > self.upper[i] + tolerance {
                return false;
            }
        }
        true
    }

    /// Evaluates the investment function at the current point.
    pub fn evaluate(&mut self) -> Result<OracleStatus> {
        let x = self.x.clone();
        self.oracle.compute(&x)
    }

    /// The objective value of the most recent evaluation.
    pub fn objective_value(&self) -> f64 {
        self.oracle.value()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::asset::Asset;
    use crate::constraint::LinearConstraint;
    use crate::fixture::StubModel;
    use crate::operation::UnitKind;
    use crate::oracle::{ModelFactory, OracleOptions};
    use float_cmp::assert_approx_eq;

    fn zero_model_factory(num_units: usize) -> ModelFactory {
        Box::new(move || {
            let mut model = StubModel::new(1, 1);
            for _ in 0..num_units {
                model = model.with_unit(UnitKind::Thermal, 1);
            }
            Box::new(model)
        })
    }

    fn problem_with_assets(
        assets: Vec<Asset>,
        constraints: Vec<LinearConstraint>,
    ) -> InvestmentProblem {
        let num_units = assets.len();
        let oracle = InvestmentOracle::new(
            assets,
            constraints,
            zero_model_factory(num_units),
            OracleOptions::default(),
        );
        InvestmentProblem::new(oracle)
    }

    #[test]
    fn test_expected_value_is_the_linear_cost_on_a_trivial_model() {
        let mut problem = problem_with_assets(
            vec![
                Asset::unit(0)
                    .with_costs(10.0, 0.0)
                    .with_installed_quantity(0.0)
                    .with_bounds(0.0, 5.0),
                Asset::unit(1)
                    .with_costs(20.0, 0.0)
                    .with_installed_quantity(0.0)
                    .with_bounds(0.0, 5.0),
            ],
            vec![],
        );

        problem.set_x(&[3.0, 1.0]);
        let status = problem.evaluate().unwrap();
        assert_eq!(status, OracleStatus::Ok);
        assert_approx_eq!(f64, problem.objective_value(), 50.0);

        assert!(problem.oracle_mut().has_linearization(true));
        assert_eq!(
            problem.oracle().linearization_coefficients().unwrap(),
            vec![10.0, 20.0]
        );
    }

    #[test]
    fn test_violated_side_constraint_yields_a_vertical_cut() {
        let mut problem = problem_with_assets(
            vec![
                Asset::unit(0)
                    .with_costs(10.0, 0.0)
                    .with_installed_quantity(0.0)
                    .with_bounds(0.0, 5.0),
                Asset::unit(1)
                    .with_costs(20.0, 0.0)
                    .with_installed_quantity(0.0)
                    .with_bounds(0.0, 5.0),
            ],
            vec![LinearConstraint::less_equal(vec![1.0, 1.0], 2.0)],
        );

        problem.set_x(&[3.0, 1.0]);
        problem.evaluate().unwrap();

        assert_eq!(problem.objective_value(), f64::INFINITY);
        assert!(!problem.oracle_mut().has_linearization(true));
        assert!(problem.oracle_mut().has_linearization(false));
        assert_eq!(
            problem.oracle().linearization_coefficients().unwrap(),
            vec![1.0, 1.0]
        );
        // the violated side reads x0 + x1 - 2 >= 0 at the current point
        assert_approx_eq!(
            f64,
            problem.oracle().linearization_constant().unwrap(),
            2.0
        );
    }

    #[test]
    fn test_disinvestment_branch() {
        let mut problem = problem_with_assets(
            vec![Asset::unit(0)
                .with_costs(10.0, 3.0)
                .with_installed_quantity(4.0)
                .with_bounds(0.0, 10.0)],
            vec![],
        );

        problem.set_x(&[2.0]);
        problem.evaluate().unwrap();
        assert_approx_eq!(f64, problem.objective_value(), 6.0);
        problem.oracle_mut().has_linearization(true);
        assert_eq!(
            problem.oracle().linearization_coefficients().unwrap(),
            vec![-3.0]
        );

        problem.set_x(&[6.0]);
        problem.evaluate().unwrap();
        assert_approx_eq!(f64, problem.objective_value(), 20.0);
        assert_eq!(
            problem.oracle().linearization_coefficients().unwrap(),
            vec![10.0]
        );
    }

    #[test]
    fn test_reformulated_bounds_symmetry() {
        let asset = Asset::unit(0)
            .with_costs(7.0, 0.0)
            .with_installed_quantity(1.0)
            .with_bounds(2.0, 5.0);

        // reformulated: internal x' = 1 corresponds to external x = 3
        let mut reformulated = problem_with_assets(vec![asset.clone()], vec![]);
        reformulated.generate_bound_constraints(true);
        assert_eq!(reformulated.bound_constraints()[0].lower, 0.0);
        assert_eq!(reformulated.bound_constraints()[0].upper, 3.0);
        reformulated.set_x(&[1.0]);
        reformulated.evaluate().unwrap();
        reformulated.oracle_mut().has_linearization(true);

        // natural bounds at the same external point
        let mut natural = problem_with_assets(vec![asset], vec![]);
        natural.generate_bound_constraints(false);
        natural.set_x(&[3.0]);
        natural.evaluate().unwrap();
        natural.oracle_mut().has_linearization(true);

        assert_approx_eq!(
            f64,
            reformulated.objective_value(),
            natural.objective_value()
        );
        assert_eq!(
            reformulated.oracle().linearization_coefficients().unwrap(),
            natural.oracle().linearization_coefficients().unwrap()
        );
        assert_approx_eq!(
            f64,
            reformulated.oracle().linearization_constant().unwrap(),
            natural.oracle().linearization_constant().unwrap()
        );
    }

    #[test]
    fn test_reformulated_vertical_cut_constants_agree() {
        let assets = || {
            vec![
                Asset::unit(0)
                    .with_installed_quantity(0.0)
                    .with_bounds(1.0, 5.0),
                Asset::unit(1)
                    .with_installed_quantity(0.0)
                    .with_bounds(0.0, 5.0),
            ]
        };
        let constraint = || vec![LinearConstraint::less_equal(vec![1.0, 1.0], 2.0)];

        let mut reformulated = problem_with_assets(assets(), constraint());
        reformulated.generate_bound_constraints(true);
        // internal (2, 1) is external (3, 1)
        reformulated.set_x(&[2.0, 1.0]);
        reformulated.evaluate().unwrap();
        reformulated.oracle_mut().has_linearization(false);

        let mut natural = problem_with_assets(assets(), constraint());
        natural.set_x(&[3.0, 1.0]);
        natural.evaluate().unwrap();
        natural.oracle_mut().has_linearization(false);

        assert_eq!(
            reformulated.oracle().linearization_coefficients().unwrap(),
            natural.oracle().linearization_coefficients().unwrap()
        );
        assert_approx_eq!(
            f64,
            reformulated.oracle().linearization_constant().unwrap(),
            natural.oracle().linearization_constant().unwrap()
        );
    }

    #[test]
    fn test_feasibility_against_natural_bounds() {
        let mut problem = problem_with_assets(
            vec![Asset::unit(0).with_bounds(0.0, 5.0)],
            vec![],
        );

        problem.set_x(&[3.0]);
        assert!(problem.is_feasible(None, false));

        problem.set_x(&[5.5]);
        assert!(!problem.is_feasible(None, false));
        assert!(problem.is_feasible(Some(1.0), false));
    }

    #[test]
    fn test_feasibility_against_abstract_constraints() {
        let mut problem = problem_with_assets(
            vec![Asset::unit(0).with_bounds(2.0, 5.0)],
            vec![],
        );
        problem.generate_bound_constraints(true);

        // the reformulated variable lives in [0, 3]
        problem.set_x(&[4.0]);
        assert!(!problem.is_feasible(None, true));

        problem.relax_bound_constraint(0, true);
        assert!(problem.is_feasible(None, true));
    }

    #[test]
    fn test_parallel_aggregation_determinism() {
        let mut reference: Option<(f64, Vec<f64>)> = None;
        for num_slots in [1, 2, 4] {
            let factory: ModelFactory = Box::new(|| {
                Box::new(
                    StubModel::new(2, 4)
                        .with_unit(UnitKind::Thermal, 1)
                        .with_objective(2.5),
                )
            });
            let oracle = InvestmentOracle::new(
                vec![Asset::unit(0)
                    .with_costs(1.0, 0.0)
                    .with_installed_quantity(0.0)],
                vec![],
                factory,
                OracleOptions {
                    num_slots,
                    ..OracleOptions::default()
                },
            );
            let mut problem = InvestmentProblem::new(oracle);
            problem.set_x(&[2.0]);
            problem.evaluate().unwrap();
            problem.oracle_mut().has_linearization(true);

            let value = problem.objective_value();
            let gradient = problem.oracle().linearization_coefficients().unwrap();
            match &reference {
                None => reference = Some((value, gradient)),
                Some((expected_value, expected_gradient)) => {
                    assert_approx_eq!(f64, value, *expected_value);
                    assert_eq!(&gradient, expected_gradient);
                }
            }
        }
    }
}
