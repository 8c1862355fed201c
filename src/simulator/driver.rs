//! The simulation driver: per-individual piecewise integration across the
//! breakpoint timeline, with between-subject variability and observation
//! derivation.
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::data::covariate::{Covariate, Covariates};
use crate::data::regimen::Regimen;
use crate::error::DosesimError;
use crate::model::{CovariateRuntime, Model};
use crate::simulator::integrator::{DormandPrince, IntegrationError, Integrator, KernelSystem};
use crate::simulator::timeline::{StateMutation, Timeline};
use crate::simulator::trajectory::{CompartmentLabel, Row, Trajectory};
use crate::simulator::variability::VariabilityModel;
use crate::simulator::V;

/// Tolerance used when binning evaluation-grid times into segments
const TIME_EPS: f64 = 1e-9;

/// Error type for simulation-call inputs
#[derive(Error, Debug, Clone)]
pub enum SimulationError {
    #[error("no value supplied for parameter `{name}`")]
    MissingParameter { name: String },
    #[error("no covariate series supplied for `{name}`")]
    MissingCovariate { name: String },
    #[error("evaluation step must be positive, got {step}")]
    InvalidStep { step: f64 },
    #[error("simulation horizon must be positive, got {tmax}")]
    InvalidHorizon { tmax: f64 },
    #[error("initial state has length {found}, model has {expected} compartment(s)")]
    InitialStateLength { expected: usize, found: usize },
    #[error("dose targets compartment {compartment}, model has {nstates} compartment(s)")]
    DoseOutOfRange { compartment: usize, nstates: usize },
    #[error("individual count must be at least 1")]
    NoIndividuals,
}

/// A configured simulation call
///
/// Holds a compiled model, a regimen and everything else one simulation needs.
/// Individuals are mutually independent: the compiled kernel and the breakpoint
/// timeline are shared read-only, while state vectors, rate vectors and
/// covariate runtime bindings are owned per individual, so the individual loop
/// runs in parallel.
///
/// # Example
///
/// ```
/// use dosesim::{ModelSpec, Regimen, Simulation};
///
/// let model = ModelSpec::from_library("one_compartment")
///     .unwrap()
///     .compile()
///     .unwrap();
/// let regimen = Regimen::builder()
///     .amount(100.0)
///     .interval(12.0)
///     .n(3)
///     .build()
///     .unwrap();
/// let trajectory = Simulation::new(&model, regimen)
///     .parameter("ke", 0.1)
///     .parameter("v", 20.0)
///     .step(1.0)
///     .run()
///     .unwrap();
/// assert!(!trajectory.is_empty());
/// ```
pub struct Simulation<'a> {
    model: &'a Model,
    parameters: HashMap<String, f64>,
    regimen: Regimen,
    covariates: Covariates,
    variability: Option<VariabilityModel>,
    n_individuals: usize,
    step: f64,
    tmax: Option<f64>,
    initial_state: Option<Vec<f64>>,
    filter: Option<Vec<String>>,
    seed: Option<u64>,
    integrator: Arc<dyn Integrator>,
}

impl<'a> Simulation<'a> {
    /// Create a simulation of `model` under `regimen`, with defaults: one
    /// individual, step 1.0, horizon from [Regimen::default_horizon], no
    /// variability
    pub fn new(model: &'a Model, regimen: Regimen) -> Self {
        Simulation {
            model,
            parameters: HashMap::new(),
            regimen,
            covariates: Covariates::new(),
            variability: None,
            n_individuals: 1,
            step: 1.0,
            tmax: None,
            initial_state: None,
            filter: None,
            seed: None,
            integrator: Arc::new(DormandPrince::default()),
        }
    }

    /// Set one parameter value by name
    pub fn parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Set several parameter values by name
    pub fn parameters<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        for (name, value) in entries {
            self.parameters.insert(name.into(), value);
        }
        self
    }

    /// Add a covariate series
    pub fn covariate(mut self, covariate: Covariate) -> Self {
        self.covariates.add_covariate(covariate);
        self
    }

    /// Replace the covariate collection
    pub fn covariates(mut self, covariates: Covariates) -> Self {
        self.covariates = covariates;
        self
    }

    /// Enable between-subject variability
    pub fn variability(mut self, variability: VariabilityModel) -> Self {
        self.variability = Some(variability);
        self
    }

    /// Set the number of simulated individuals
    pub fn individuals(mut self, n_individuals: usize) -> Self {
        self.n_individuals = n_individuals;
        self
    }

    /// Set the evaluation step of the global output grid over `[0, tmax]`
    pub fn step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// Set the simulation horizon explicitly
    pub fn horizon(mut self, tmax: f64) -> Self {
        self.tmax = Some(tmax);
        self
    }

    /// Supply an explicit initial state, overriding the model's init block
    pub fn initial_state(mut self, state: Vec<f64>) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Restrict the output to the given compartment labels (`"1"`, `"2"`,
    /// ..., `"obs"`)
    pub fn compartments<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Seed the variability sampler for reproducible draws
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the numeric integrator
    pub fn integrator(mut self, integrator: Arc<dyn Integrator>) -> Self {
        self.integrator = integrator;
        self
    }

    /// Run the simulation
    pub fn run(&self) -> Result<Trajectory, DosesimError> {
        if self.n_individuals == 0 {
            return Err(SimulationError::NoIndividuals.into());
        }
        if !(self.step > 0.0) {
            return Err(SimulationError::InvalidStep { step: self.step }.into());
        }
        if let Some(state) = &self.initial_state {
            if state.len() != self.model.nstates() {
                return Err(SimulationError::InitialStateLength {
                    expected: self.model.nstates(),
                    found: state.len(),
                }
                .into());
            }
        }

        // Bind every declared parameter once, by name, in declaration order
        let base: Vec<f64> = self
            .model
            .parameters()
            .iter()
            .map(|name| {
                self.parameters.get(name).copied().ok_or_else(|| {
                    SimulationError::MissingParameter { name: name.clone() }
                })
            })
            .collect::<Result<_, _>>()?;

        for name in self.model.covariates() {
            if self.covariates.get_covariate(name).is_none() {
                return Err(SimulationError::MissingCovariate { name: name.clone() }.into());
            }
        }

        for dose in self.regimen.doses() {
            let input = dose.input().unwrap_or(self.model.dose_compartment());
            if input >= self.model.nstates() {
                return Err(SimulationError::DoseOutOfRange {
                    compartment: input + 1,
                    nstates: self.model.nstates(),
                }
                .into());
            }
        }

        let tmax = self.tmax.unwrap_or_else(|| self.regimen.default_horizon());
        if !(tmax > 0.0) {
            return Err(SimulationError::InvalidHorizon { tmax }.into());
        }

        let timeline = Timeline::build(&self.regimen, tmax, self.model.dose_compartment());
        let n_steps = (tmax / self.step + TIME_EPS).floor() as usize;
        let grid: Vec<f64> = (0..=n_steps).map(|i| i as f64 * self.step).collect();
        debug!(
            breakpoints = timeline.breakpoints().len(),
            grid_points = grid.len(),
            tmax,
            "built simulation timeline"
        );

        let deviations: Option<(usize, Array2<f64>)> = match &self.variability {
            Some(variability) => {
                let n = variability.dimension()?;
                if n > base.len() {
                    return Err(crate::simulator::variability::VariabilityError::TooManyParameters {
                        n,
                        nparams: base.len(),
                    }
                    .into());
                }
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                Some((n, variability.sample(self.n_individuals, &mut rng)?))
            }
            None => None,
        };

        let individual_parameters: Vec<Vec<f64>> = (0..self.n_individuals)
            .map(|individual| {
                let mut parameters = base.clone();
                if let (Some(variability), Some((n, deviations))) =
                    (&self.variability, &deviations)
                {
                    let row: Vec<f64> = deviations.row(individual).to_vec();
                    variability.apply(&mut parameters[..*n], &row);
                }
                parameters
            })
            .collect();

        let results: Result<Vec<Vec<Row>>, DosesimError> = individual_parameters
            .par_iter()
            .enumerate()
            .map(|(index, parameters)| {
                self.simulate_individual(index + 1, parameters, &timeline, &grid)
            })
            .collect();
        let mut rows: Vec<Row> = results?.into_iter().flatten().collect();

        if let Some(filter) = &self.filter {
            rows.retain(|row| filter.iter().any(|label| row.compartment.matches(label)));
        }
        Ok(Trajectory::from_rows(rows))
    }

    /// Simulate one individual across the breakpoint timeline
    ///
    /// The final state of each segment is threaded explicitly into the next:
    /// bolus mutations apply to it, then the segment's grid times go to the
    /// integrator in one call, so discontinuities never fall inside a
    /// continuous integration.
    fn simulate_individual(
        &self,
        id: usize,
        parameters: &[f64],
        timeline: &Timeline,
        grid: &[f64],
    ) -> Result<Vec<Row>, DosesimError> {
        let model = self.model;
        let nstates = model.nstates();
        let p = V::from_vec(parameters.to_vec());

        let mut runtime = self.runtime_at(0.0)?;
        let mut x = match &self.initial_state {
            Some(state) => V::from_vec(state.clone()),
            None => model.initial_state(&p, &runtime),
        };
        let mut rates = V::zeros(nstates);

        // (time, state, observation scale) per emitted grid point
        let mut records: Vec<(f64, V, f64)> = Vec::with_capacity(grid.len());
        let mut next_point = 0usize;
        let mut t_cursor = 0.0;

        for breakpoint in timeline.breakpoints() {
            let t_end = breakpoint.time();
            if t_end > t_cursor + TIME_EPS {
                runtime = self.runtime_at(t_cursor)?;

                let first = next_point;
                while next_point < grid.len() && grid[next_point] < t_end - TIME_EPS {
                    next_point += 1;
                }
                let interior = &grid[first..next_point];

                let mut times = Vec::with_capacity(interior.len() + 2);
                times.push(t_cursor);
                times.extend_from_slice(interior);
                times.push(t_end);

                let system = KernelSystem::new(model, &p, &rates, &runtime);
                let states = self
                    .integrator
                    .solve(&system, x.clone(), &times)
                    .map_err(|source| IntegrationError::Individual {
                        id,
                        segment_start: t_cursor,
                        source: Box::new(source),
                    })?;

                for (offset, time) in interior.iter().enumerate() {
                    let state = &states[offset + 1];
                    check_finite(id, t_cursor, *time, state)?;
                    let scale = model.scale_at(state, *time, &p, &runtime).unwrap_or(1.0);
                    records.push((*time, state.clone(), scale));
                }
                if let Some(last) = states.last() {
                    x = last.clone();
                }
                check_finite(id, t_cursor, t_end, &x)?;
            }

            for mutation in breakpoint.mutations() {
                match mutation {
                    StateMutation::Bolus {
                        compartment,
                        amount,
                    } => x[*compartment] += *amount,
                    StateMutation::RateOn { compartment, rate } => rates[*compartment] += *rate,
                    StateMutation::RateOff { compartment, rate } => rates[*compartment] -= *rate,
                }
            }
            t_cursor = t_end;
        }

        // Grid points at the horizon itself
        if next_point < grid.len() {
            runtime = self.runtime_at(t_cursor)?;
            while next_point < grid.len() {
                let time = grid[next_point];
                let scale = model.scale_at(&x, time, &p, &runtime).unwrap_or(1.0);
                records.push((time, x.clone(), scale));
                next_point += 1;
            }
        }

        // Assemble compartment-major, then the synthetic obs compartment
        let has_observation = model.observation.is_some();
        let mut rows =
            Vec::with_capacity(records.len() * (nstates + usize::from(has_observation)));
        for compartment in 0..nstates {
            for (time, state, _) in &records {
                rows.push(Row {
                    id,
                    time: *time,
                    compartment: CompartmentLabel::State(compartment),
                    value: state[compartment],
                });
            }
        }
        if let Some(observation) = &model.observation {
            for (time, state, scale) in &records {
                rows.push(Row {
                    id,
                    time: *time,
                    compartment: CompartmentLabel::Observation,
                    value: state[observation.compartment] / scale,
                });
            }
        }
        Ok(rows)
    }

    /// Refresh the covariate runtime bindings at a segment start
    fn runtime_at(&self, time: f64) -> Result<CovariateRuntime, DosesimError> {
        let mut runtime = CovariateRuntime::new();
        for name in self.model.covariates() {
            if let Some(covariate) = self.covariates.get_covariate(name) {
                runtime.bind(name.clone(), covariate.segment_at(time)?);
            }
        }
        Ok(runtime)
    }
}

fn check_finite(
    id: usize,
    segment_start: f64,
    time: f64,
    state: &V,
) -> Result<(), DosesimError> {
    for (compartment, value) in state.iter().enumerate() {
        if !value.is_finite() {
            return Err(IntegrationError::Individual {
                id,
                segment_start,
                source: Box::new(IntegrationError::NonFiniteState { time, compartment }),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use approx::assert_relative_eq;

    fn decay_model() -> Model {
        ModelSpec::builder()
            .equation("dx[1] = -ke * x[1];")
            .parameters(["ke", "v"])
            .observe(1, "v")
            .build()
            .compile()
            .unwrap()
    }

    fn single_bolus() -> Regimen {
        Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_parameter_is_fatal() {
        let model = decay_model();
        let result = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .run();
        assert!(matches!(
            result,
            Err(DosesimError::Simulation(SimulationError::MissingParameter { .. }))
        ));
    }

    #[test]
    fn test_missing_covariate_is_fatal() {
        let model = ModelSpec::builder()
            .equation("dx[1] = -(ke * wt / 70) * x[1];")
            .parameters(["ke"])
            .covariate("wt")
            .build()
            .compile()
            .unwrap();
        let result = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .run();
        assert!(matches!(
            result,
            Err(DosesimError::Simulation(SimulationError::MissingCovariate { .. }))
        ));
    }

    #[test]
    fn test_invalid_step_is_fatal() {
        let model = decay_model();
        let result = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .step(0.0)
            .run();
        assert!(matches!(
            result,
            Err(DosesimError::Simulation(SimulationError::InvalidStep { .. }))
        ));
    }

    #[test]
    fn test_row_layout() {
        let model = decay_model();
        let trajectory = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .step(1.0)
            .horizon(10.0)
            .run()
            .unwrap();
        // 11 grid points, one state compartment plus obs
        assert_eq!(trajectory.len(), 22);
        let rows = trajectory.rows();
        assert_eq!(rows[0].compartment, CompartmentLabel::State(0));
        assert_eq!(rows[0].time, 0.0);
        assert_eq!(rows[11].compartment, CompartmentLabel::Observation);
        // Rows are time-ordered within a compartment
        for pair in rows[..11].windows(2) {
            assert!(pair[0].time < pair[1].time);
        }
    }

    #[test]
    fn test_bolus_applied_before_emission_at_dose_time() {
        let model = decay_model();
        let trajectory = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .step(1.0)
            .horizon(5.0)
            .run()
            .unwrap();
        let first = &trajectory.rows()[0];
        assert_eq!(first.time, 0.0);
        // The dose at t = 0 is visible at the t = 0 grid point
        assert_relative_eq!(first.value, 100.0);
    }

    #[test]
    fn test_observation_rows_are_scaled() {
        let model = decay_model();
        let trajectory = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .step(1.0)
            .horizon(10.0)
            .run()
            .unwrap();
        let states: Vec<&Row> = trajectory.compartment("1").collect();
        let observations: Vec<&Row> = trajectory.compartment("obs").collect();
        assert_eq!(states.len(), observations.len());
        for (state, observation) in states.iter().zip(observations.iter()) {
            assert_eq!(state.time, observation.time);
            assert_relative_eq!(observation.value, state.value / 20.0);
        }
    }

    #[test]
    fn test_compartment_filter() {
        let model = decay_model();
        let trajectory = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .step(1.0)
            .horizon(10.0)
            .compartments(["obs"])
            .run()
            .unwrap();
        assert_eq!(trajectory.len(), 11);
        assert!(trajectory
            .rows()
            .iter()
            .all(|row| row.compartment == CompartmentLabel::Observation));
    }

    #[test]
    fn test_explicit_initial_state() {
        let model = decay_model();
        let regimen = Regimen::builder()
            .amounts(vec![None])
            .times(vec![0.0])
            .build()
            .unwrap();
        let trajectory = Simulation::new(&model, regimen)
            .parameter("ke", 0.0)
            .parameter("v", 20.0)
            .initial_state(vec![42.0])
            .step(1.0)
            .horizon(3.0)
            .run()
            .unwrap();
        for row in trajectory.compartment("1") {
            assert_relative_eq!(row.value, 42.0, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_dose_compartment_out_of_range_is_fatal() {
        let model = decay_model();
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .compartment(2)
            .build()
            .unwrap();
        let result = Simulation::new(&model, regimen)
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .run();
        assert!(matches!(
            result,
            Err(DosesimError::Simulation(SimulationError::DoseOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_explicit_dose_compartment_overrides_the_default() {
        // Two-compartment absorption model, dosing straight into the central
        // compartment instead of the depot
        let model = ModelSpec::from_library("one_compartment_with_absorption")
            .unwrap()
            .compile()
            .unwrap();
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .compartment(2)
            .build()
            .unwrap();
        let trajectory = Simulation::new(&model, regimen)
            .parameter("ka", 1.0)
            .parameter("ke", 0.0)
            .parameter("v", 20.0)
            .step(1.0)
            .horizon(2.0)
            .run()
            .unwrap();
        let rows = trajectory.rows();
        // Depot stays empty, central holds the dose
        let depot_start = rows
            .iter()
            .find(|row| row.compartment == CompartmentLabel::State(0) && row.time == 0.0)
            .unwrap();
        let central_start = rows
            .iter()
            .find(|row| row.compartment == CompartmentLabel::State(1) && row.time == 0.0)
            .unwrap();
        assert_relative_eq!(depot_start.value, 0.0);
        assert_relative_eq!(central_start.value, 100.0);
    }

    #[test]
    fn test_individual_ids_are_one_based() {
        let model = decay_model();
        let trajectory = Simulation::new(&model, single_bolus())
            .parameter("ke", 0.1)
            .parameter("v", 20.0)
            .individuals(3)
            .step(2.0)
            .horizon(4.0)
            .run()
            .unwrap();
        let ids: std::collections::BTreeSet<usize> =
            trajectory.rows().iter().map(|row| row.id).collect();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
