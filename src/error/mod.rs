use thiserror::Error;

use crate::data::covariate::CovariateError;
use crate::data::regimen::RegimenError;
use crate::model::compiler::SpecificationError;
use crate::simulator::driver::SimulationError;
use crate::simulator::integrator::IntegrationError;
use crate::simulator::variability::VariabilityError;

/// Top-level error type for the crate
///
/// Every fallible public operation returns this type, wrapping the error of the
/// component that failed.
#[derive(Error, Debug)]
pub enum DosesimError {
    #[error("Error in the model specification: {0}")]
    Specification(#[from] SpecificationError),
    #[error("Error in the dose regimen: {0}")]
    Regimen(#[from] RegimenError),
    #[error("Error in a covariate: {0}")]
    Covariate(#[from] CovariateError),
    #[error("Error in the variability model: {0}")]
    Variability(#[from] VariabilityError),
    #[error("Error in the simulation inputs: {0}")]
    Simulation(#[from] SimulationError),
    #[error("Error during integration: {0}")]
    Integration(#[from] IntegrationError),
}
