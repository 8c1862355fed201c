pub mod covariate;
pub mod regimen;

pub use covariate::{Covariate, Covariates, Interpolation};
pub use regimen::{Dose, DoseType, Regimen, RegimenBuilder};
