pub mod driver;
pub mod integrator;
pub mod timeline;
pub mod trajectory;
pub mod variability;

/// Scalar type used throughout the simulator
pub type T = f64;
/// State vector type used throughout the simulator
pub type V = nalgebra::DVector<T>;

pub use driver::{Simulation, SimulationError};
