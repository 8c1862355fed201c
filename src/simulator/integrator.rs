//! The external integrator boundary.
//!
//! The simulation driver treats numeric stepping as a black box behind the
//! [Integrator] trait: given a derivative kernel, an initial state and an
//! ordered list of time points, the collaborator returns the state at every
//! requested time. The default implementation wraps the Dormand-Prince 5(4)
//! stepper from `ode_solvers`.
use thiserror::Error;

use crate::model::{CovariateRuntime, Model};
use crate::simulator::{T, V};

const RTOL: f64 = 1e-4;
const ATOL: f64 = 1e-4;

/// Error type for numeric integration
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("ODE solver failed over [{start}, {end}]: {detail}")]
    SolverFailure {
        start: f64,
        end: f64,
        detail: String,
    },
    #[error("non-finite state at time {time} in compartment {compartment}")]
    NonFiniteState { time: f64, compartment: usize },
    #[error("individual {id}, segment starting at {segment_start}: {source}")]
    Individual {
        id: usize,
        segment_start: f64,
        #[source]
        source: Box<IntegrationError>,
    },
}

/// The compiled kernel plus its per-segment runtime inputs, adapted to the
/// solver's system interface
///
/// Parameters, infusion rates and covariate bindings are all constant for the
/// duration of one segment; the driver rebuilds this adapter per segment.
#[derive(Clone)]
pub struct KernelSystem<'a> {
    model: &'a Model,
    parameters: &'a V,
    rates: &'a V,
    covariates: &'a CovariateRuntime,
}

impl<'a> KernelSystem<'a> {
    pub fn new(
        model: &'a Model,
        parameters: &'a V,
        rates: &'a V,
        covariates: &'a CovariateRuntime,
    ) -> Self {
        KernelSystem {
            model,
            parameters,
            rates,
            covariates,
        }
    }
}

impl ode_solvers::System<T, V> for KernelSystem<'_> {
    fn system(&self, t: T, y: &V, dy: &mut V) {
        self.model
            .derivatives(y, t, self.parameters, self.rates, self.covariates, dy);
    }
}

/// An external ODE-solving routine, consumed as a black box
///
/// Implementations must return the state at every requested time point, in
/// order. `times` is non-empty and non-decreasing, and `times[0]` is the time
/// of the supplied initial state. Non-stiff capability is assumed; internal
/// step control is up to the implementation.
pub trait Integrator: Send + Sync {
    fn solve(
        &self,
        system: &KernelSystem<'_>,
        x0: V,
        times: &[f64],
    ) -> Result<Vec<V>, IntegrationError>;
}

/// Default integrator: Dormand-Prince 5(4) with adaptive internal stepping
#[derive(Debug, Clone)]
pub struct DormandPrince {
    rtol: f64,
    atol: f64,
}

impl DormandPrince {
    pub fn new(rtol: f64, atol: f64) -> Self {
        DormandPrince { rtol, atol }
    }
}

impl Default for DormandPrince {
    fn default() -> Self {
        DormandPrince {
            rtol: RTOL,
            atol: ATOL,
        }
    }
}

impl Integrator for DormandPrince {
    fn solve(
        &self,
        system: &KernelSystem<'_>,
        x0: V,
        times: &[f64],
    ) -> Result<Vec<V>, IntegrationError> {
        let mut states = Vec::with_capacity(times.len());
        let mut x = x0;
        states.push(x.clone());
        for window in times.windows(2) {
            let (start, end) = (window[0], window[1]);
            if end - start < f64::EPSILON {
                states.push(x.clone());
                continue;
            }
            let mut stepper = ode_solvers::Dopri5::new(
                system.clone(),
                start,
                end,
                end - start,
                x.clone(),
                self.rtol,
                self.atol,
            );
            stepper
                .integrate()
                .map_err(|e| IntegrationError::SolverFailure {
                    start,
                    end,
                    detail: format!("{:?}", e),
                })?;
            x = stepper
                .y_out()
                .last()
                .cloned()
                .ok_or_else(|| IntegrationError::SolverFailure {
                    start,
                    end,
                    detail: "solver returned no output".to_string(),
                })?;
            states.push(x.clone());
        }
        Ok(states)
    }
}
