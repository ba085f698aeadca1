use rand::prelude::*;
use rand_distr;
use rand_xoshiro;

/// Generates the exogenous noises of one stage, one distribution per
/// noise entity (demand series, inflow series, availability factor).
pub struct StageNoiseGenerator<D: rand_distr::Distribution<f64>> {
    pub distributions: Vec<D>,
    pub num_entities: usize,
}

/// Generates the full scenario set of an operational model: a fixed
/// number of independent realizations of every stage's noise entities,
/// reproducible from a seed.
pub struct NoiseGenerator<D: rand_distr::Distribution<f64>> {
    pub stage_generators: Vec<StageNoiseGenerator<D>>,
}

impl<D: rand_distr::Distribution<f64>> NoiseGenerator<D> {
    pub fn new() -> Self {
        Self {
            stage_generators: vec![],
        }
    }

    pub fn add_stage_generator(&mut self, distributions: Vec<D>) {
        let num_entities = distributions.len();
        self.stage_generators.push(StageNoiseGenerator {
            distributions,
            num_entities,
        });
    }

    /// Generates a scenario set with the given number of scenarios.
    ///
    /// `seed` must be an u64
    ///
    /// ## Example
    ///
    /// ```
    /// let mu = 3.6;
    /// let sigma = 0.6928;
    /// let num_entities = 2;
    /// let mut generator = xpansion::scenario::NoiseGenerator::new();
    /// generator.add_stage_generator(
    ///     vec![rand_distr::LogNormal::new(mu, sigma).unwrap(); num_entities]);
    /// let scenarios = generator.generate(0, 10);
    /// assert_eq!(scenarios.num_stages(), 1);
    /// assert_eq!(scenarios.num_scenarios(), 10);
    /// assert_eq!(scenarios.noises(0, 3).unwrap().len(), num_entities);
    /// ```
    pub fn generate(&self, seed: u64, num_scenarios: usize) -> ScenarioSet {
        let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(seed);

        let mut noises = Vec::with_capacity(self.stage_generators.len());
        for stage_generator in self.stage_generators.iter() {
            // sampled by [entity][scenario], stored by [scenario][entity]
            let entity_noises: Vec<Vec<f64>> = stage_generator
                .distributions
                .iter()
                .map(|entity_generator| {
                    entity_generator
                        .sample_iter(&mut rng)
                        .take(num_scenarios)
                        .collect()
                })
                .collect();

            let mut stage_noises =
                vec![
                    Vec::<f64>::with_capacity(stage_generator.num_entities);
                    num_scenarios
                ];
            for scenario_noises in entity_noises.iter() {
                for (scenario, &noise) in scenario_noises.iter().enumerate() {
                    stage_noises[scenario].push(noise);
                }
            }
            noises.push(stage_noises);
        }

        ScenarioSet { noises }
    }
}

impl<D: rand_distr::Distribution<f64>> Default for NoiseGenerator<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed set of noise realizations, indexed by stage and scenario.
/// Scenarios are independent across stages given the investment point;
/// the operational model reads the entry of its current (stage,
/// scenario) pair when building a subproblem.
#[derive(Debug, Clone)]
pub struct ScenarioSet {
    // indexed by stage | scenario | entity
    noises: Vec<Vec<Vec<f64>>>,
}

impl ScenarioSet {
    pub fn num_stages(&self) -> usize {
        self.noises.len()
    }

    pub fn num_scenarios(&self) -> usize {
        self.noises.first().map_or(0, |stage| stage.len())
    }

    pub fn noises(&self, stage: usize, scenario: usize) -> Option<&[f64]> {
        Some(self.noises.get(stage)?.get(scenario)?.as_slice())
    }
}
