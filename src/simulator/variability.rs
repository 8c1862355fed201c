//! Between-subject variability: expansion of a packed covariance vector and
//! multivariate-normal sampling of per-individual parameter deviations.
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the variability model
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum VariabilityError {
    #[error("packed covariance length {len} is not a triangular number")]
    BadLength { len: usize },
    #[error("covariance spans {n} parameters but the model declares only {nparams}")]
    TooManyParameters { n: usize, nparams: usize },
    #[error("covariance matrix is not positive definite")]
    NotPositiveDefinite,
}

/// How a sampled deviation perturbs a population parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariabilityTransform {
    /// Multiplicative: `parameter * exp(deviation)` (log-normal parameters)
    Exponential,
    /// Additive: `parameter + deviation`
    Additive,
}

/// A between-subject variability model
///
/// The covariance among the first `n` declared parameters is given as a packed
/// lower-triangular vector of length `n(n+1)/2`, row-major and including the
/// diagonal: `[v00, v10, v11, v20, v21, v22, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariabilityModel {
    omega: Vec<f64>,
    transform: VariabilityTransform,
}

impl VariabilityModel {
    /// Create a variability model with the given packed covariance and transform
    pub fn new(omega: impl Into<Vec<f64>>, transform: VariabilityTransform) -> Self {
        VariabilityModel {
            omega: omega.into(),
            transform,
        }
    }

    /// Multiplicative (log-normal) variability
    pub fn exponential(omega: impl Into<Vec<f64>>) -> Self {
        Self::new(omega, VariabilityTransform::Exponential)
    }

    /// Additive variability
    pub fn additive(omega: impl Into<Vec<f64>>) -> Self {
        Self::new(omega, VariabilityTransform::Additive)
    }

    /// The packed lower-triangular covariance vector
    pub fn omega(&self) -> &[f64] {
        &self.omega
    }

    /// The configured transform
    pub fn transform(&self) -> VariabilityTransform {
        self.transform
    }

    /// The covariance dimension `n`, recovered from the packed length `n(n+1)/2`
    pub fn dimension(&self) -> Result<usize, VariabilityError> {
        let len = self.omega.len();
        let mut n = 0usize;
        while n * (n + 1) / 2 < len {
            n += 1;
        }
        if n == 0 || n * (n + 1) / 2 != len {
            return Err(VariabilityError::BadLength { len });
        }
        Ok(n)
    }

    /// Expand the packed vector into the symmetric covariance matrix
    ///
    /// Entry `(i, j)` with `i >= j` maps to packed index `i(i+1)/2 + j`.
    pub fn expand(&self) -> Result<DMatrix<f64>, VariabilityError> {
        let n = self.dimension()?;
        let mut matrix = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..=i {
                let value = self.omega[i * (i + 1) / 2 + j];
                matrix[(i, j)] = value;
                matrix[(j, i)] = value;
            }
        }
        Ok(matrix)
    }

    /// Draw one deviation vector per individual
    ///
    /// Deviations are multivariate normal with mean zero and the expanded
    /// covariance; a zero covariance yields exactly zero deviations.
    pub(crate) fn sample(
        &self,
        n_individuals: usize,
        rng: &mut impl Rng,
    ) -> Result<Array2<f64>, VariabilityError> {
        let n = self.dimension()?;
        let mut deviations = Array2::zeros((n_individuals, n));

        if self.omega.iter().all(|value| *value == 0.0) {
            return Ok(deviations);
        }

        let matrix = self.expand()?;
        let cholesky = matrix
            .cholesky()
            .ok_or(VariabilityError::NotPositiveDefinite)?;
        let lower = cholesky.l();

        for mut row in deviations.rows_mut() {
            let z: DVector<f64> =
                DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
            let deviation = &lower * z;
            for (slot, value) in row.iter_mut().zip(deviation.iter()) {
                *slot = *value;
            }
        }
        Ok(deviations)
    }

    /// Apply one individual's deviations to the first `n` parameters, in
    /// declaration order
    pub(crate) fn apply(&self, parameters: &mut [f64], deviations: &[f64]) {
        for (parameter, deviation) in parameters.iter_mut().zip(deviations.iter()) {
            match self.transform {
                VariabilityTransform::Exponential => *parameter *= deviation.exp(),
                VariabilityTransform::Additive => *parameter += deviation,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dimension() {
        assert_eq!(VariabilityModel::exponential(vec![0.1]).dimension().unwrap(), 1);
        assert_eq!(
            VariabilityModel::exponential(vec![0.1, 0.0, 0.2])
                .dimension()
                .unwrap(),
            2
        );
        assert_eq!(
            VariabilityModel::exponential(vec![0.1; 6]).dimension().unwrap(),
            3
        );
        assert!(matches!(
            VariabilityModel::exponential(vec![0.1, 0.2]).dimension(),
            Err(VariabilityError::BadLength { len: 2 })
        ));
        assert!(matches!(
            VariabilityModel::exponential(Vec::new()).dimension(),
            Err(VariabilityError::BadLength { len: 0 })
        ));
    }

    #[test]
    fn test_expansion() {
        let model = VariabilityModel::exponential(vec![0.09, 0.01, 0.04]);
        let matrix = model.expand().unwrap();
        assert_eq!(matrix[(0, 0)], 0.09);
        assert_eq!(matrix[(1, 0)], 0.01);
        assert_eq!(matrix[(0, 1)], 0.01);
        assert_eq!(matrix[(1, 1)], 0.04);
    }

    #[test]
    fn test_zero_covariance_yields_zero_deviations() {
        let model = VariabilityModel::exponential(vec![0.0, 0.0, 0.0]);
        let mut rng = StdRng::seed_from_u64(17);
        let deviations = model.sample(5, &mut rng).unwrap();
        assert!(deviations.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn test_sampling_matches_dimension() {
        let model = VariabilityModel::exponential(vec![0.09, 0.0, 0.04]);
        let mut rng = StdRng::seed_from_u64(17);
        let deviations = model.sample(100, &mut rng).unwrap();
        assert_eq!(deviations.dim(), (100, 2));
        // With zero correlation and positive variances the draws vary
        assert!(deviations.iter().any(|value| *value != 0.0));
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let model = VariabilityModel::exponential(vec![0.09]);
        let a = model.sample(10, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = model.sample(10, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_positive_definite_is_fatal() {
        // Off-diagonal exceeds the diagonal: not a valid covariance
        let model = VariabilityModel::exponential(vec![0.01, 0.5, 0.01]);
        let mut rng = StdRng::seed_from_u64(17);
        assert!(matches!(
            model.sample(2, &mut rng),
            Err(VariabilityError::NotPositiveDefinite)
        ));
    }

    #[test]
    fn test_exponential_transform() {
        let model = VariabilityModel::exponential(vec![0.09]);
        let mut parameters = vec![2.0, 10.0];
        model.apply(&mut parameters[..1], &[0.5]);
        assert_relative_eq!(parameters[0], 2.0 * 0.5f64.exp());
        // Parameters beyond the covariance dimension are untouched
        assert_eq!(parameters[1], 10.0);
    }

    #[test]
    fn test_additive_transform() {
        let model = VariabilityModel::additive(vec![0.09]);
        let mut parameters = vec![2.0];
        model.apply(&mut parameters, &[0.5]);
        assert_relative_eq!(parameters[0], 2.5);
    }

    #[test]
    fn test_zero_deviation_is_identity() {
        let exponential = VariabilityModel::exponential(vec![0.09]);
        let additive = VariabilityModel::additive(vec![0.09]);
        let mut a = vec![2.0];
        let mut b = vec![2.0];
        exponential.apply(&mut a, &[0.0]);
        additive.apply(&mut b, &[0.0]);
        assert_eq!(a[0], 2.0);
        assert_eq!(b[0], 2.0);
    }
}
