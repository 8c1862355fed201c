pub mod data;
pub mod error;
pub mod model;
pub mod simulator;

pub use crate::data::covariate::{Covariate, Covariates, Interpolation};
pub use crate::data::regimen::{Dose, DoseType, Regimen, RegimenBuilder};
pub use crate::error::DosesimError;
pub use crate::model::{library, Model, ModelSpec, ObservationSpec};
pub use crate::simulator::integrator::{DormandPrince, Integrator};
pub use crate::simulator::trajectory::{CompartmentLabel, Row, Trajectory};
pub use crate::simulator::variability::{VariabilityModel, VariabilityTransform};
pub use crate::simulator::Simulation;

pub mod prelude {
    pub mod data {
        pub use crate::data::covariate::{Covariate, Covariates, Interpolation};
        pub use crate::data::regimen::{Dose, DoseType, Regimen, RegimenBuilder};
    }
    pub mod model {
        pub use crate::model::{library, Model, ModelSpec, ObservationSpec};
    }
    pub mod simulator {
        pub use crate::simulator::integrator::{DormandPrince, Integrator};
        pub use crate::simulator::timeline::{Breakpoint, StateMutation, Timeline};
        pub use crate::simulator::trajectory::{CompartmentLabel, Row, Trajectory};
        pub use crate::simulator::variability::{VariabilityModel, VariabilityTransform};
        pub use crate::simulator::Simulation;
    }

    pub use crate::data::covariate::{Covariate, Covariates};
    pub use crate::data::regimen::{DoseType, Regimen};
    pub use crate::error::DosesimError;
    pub use crate::model::{Model, ModelSpec};
    pub use crate::simulator::trajectory::{CompartmentLabel, Trajectory};
    pub use crate::simulator::variability::{VariabilityModel, VariabilityTransform};
    pub use crate::simulator::Simulation;
}
