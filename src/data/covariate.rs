use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Error type for covariate operations
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CovariateError {
    #[error("covariate `{name}` has {times} times but {values} values")]
    LengthMismatch {
        name: String,
        times: usize,
        values: usize,
    },
    #[error("covariate `{name}` has no observations")]
    Empty { name: String },
    #[error("covariate `{name}` times must be strictly increasing (at index {index})")]
    NonIncreasingTimes { name: String, index: usize },
    #[error("no segments available for interpolation")]
    MissingSegments,
}

/// Method used to interpolate covariate values between observations
#[derive(Serialize, Clone, Debug, Deserialize)]
pub enum Interpolation {
    /// Linear interpolation between two points with slope and intercept
    Linear { slope: f64, intercept: f64 },
    /// Constant value carried forward
    CarryForward { value: f64 },
}

/// A covariate value and local gradient on one interpolation segment
///
/// The covariate value at any time `t` within the segment is
/// `value + gradient * (t - from)`. Carry-forward segments and the clamped
/// regions before the first and after the last observation have gradient 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Start time of the segment
    pub from: f64,
    /// Covariate value at the segment start
    pub value: f64,
    /// Local gradient of the covariate over the segment
    pub gradient: f64,
}

/// A segment of a piecewise interpolation function for a covariate
#[derive(Serialize, Clone, Debug, Deserialize)]
struct CovariateSegment {
    from: f64,
    to: f64,
    method: Interpolation,
}

impl CovariateSegment {
    #[inline]
    fn interpolate(&self, time: f64) -> Option<f64> {
        if !self.in_interval(time) {
            return None;
        }

        match self.method {
            Interpolation::Linear { slope, intercept } => Some(slope * time + intercept),
            Interpolation::CarryForward { value } => Some(value),
        }
    }

    #[inline]
    fn in_interval(&self, time: f64) -> bool {
        self.from <= time && time < self.to
    }

    fn info(&self) -> SegmentInfo {
        match self.method {
            Interpolation::Linear { slope, intercept } => SegmentInfo {
                from: self.from,
                value: slope * self.from + intercept,
                gradient: slope,
            },
            Interpolation::CarryForward { value } => SegmentInfo {
                from: self.from,
                value,
                gradient: 0.0,
            },
        }
    }
}

/// A named, time-varying covariate
///
/// A [Covariate] holds a series of observations with strictly increasing times
/// and interpolates between them, either linearly or with carry-forward.
/// Covariates are immutable once constructed; the interpolation segments are
/// built eagerly at construction time.
#[derive(Serialize, Clone, Debug, Deserialize)]
pub struct Covariate {
    name: String,
    times: Vec<f64>,
    values: Vec<f64>,
    segments: Vec<CovariateSegment>,
    /// Carry-forward interpolation instead of linear
    fixed: bool,
}

impl Covariate {
    /// Create a covariate with linear interpolation between observations
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the covariate, as referenced in model equations
    /// * `times` - Observation times, strictly increasing
    /// * `values` - Observed values, one per time
    pub fn linear(
        name: impl Into<String>,
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, CovariateError> {
        Self::new(name, times, values, false)
    }

    /// Create a covariate that carries each observation forward until the next
    pub fn carry_forward(
        name: impl Into<String>,
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, CovariateError> {
        Self::new(name, times, values, true)
    }

    /// Create a covariate with a single constant value
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        // A single observation cannot violate any invariant
        Self::new(name, vec![0.0], vec![value], true).unwrap_or_else(|_| unreachable!())
    }

    /// Create a new covariate
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the covariate
    /// * `times` - Observation times, strictly increasing
    /// * `values` - Observed values, one per time
    /// * `fixed` - Whether this covariate should use carry-forward interpolation
    pub fn new(
        name: impl Into<String>,
        times: Vec<f64>,
        values: Vec<f64>,
        fixed: bool,
    ) -> Result<Self, CovariateError> {
        let name = name.into();
        if times.len() != values.len() {
            return Err(CovariateError::LengthMismatch {
                name,
                times: times.len(),
                values: values.len(),
            });
        }
        if times.is_empty() {
            return Err(CovariateError::Empty { name });
        }
        for (index, pair) in times.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(CovariateError::NonIncreasingTimes {
                    name,
                    index: index + 1,
                });
            }
        }

        let mut covariate = Covariate {
            name,
            times,
            values,
            segments: Vec::new(),
            fixed,
        };
        covariate.build_segments();
        Ok(covariate)
    }

    /// Build segments from the observations
    fn build_segments(&mut self) {
        self.segments.clear();

        for i in 0..self.times.len() {
            let (time, value) = (self.times[i], self.values[i]);
            let next = self.times.get(i + 1).copied();
            let to = next.unwrap_or(f64::INFINITY);

            if self.fixed {
                self.segments.push(CovariateSegment {
                    from: time,
                    to,
                    method: Interpolation::CarryForward { value },
                });
            } else if let Some(next_time) = next {
                let slope = (self.values[i + 1] - value) / (next_time - time);
                self.segments.push(CovariateSegment {
                    from: time,
                    to: next_time,
                    method: Interpolation::Linear {
                        slope,
                        intercept: value - slope * time,
                    },
                });
            }
        }
    }

    /// Interpolate the covariate value at a specific time
    ///
    /// Times before the first observation clamp to the first value; times at or
    /// after the last observation carry the last value forward.
    #[inline]
    pub fn interpolate(&self, time: f64) -> Result<f64, CovariateError> {
        let info = self.segment_at(time)?;
        Ok(info.value + info.gradient * (time - info.from))
    }

    /// Locate the interpolation segment containing a specific time
    ///
    /// Returns the segment start, the value at the segment start and the local
    /// gradient. Queries before the first observation clamp to the first value
    /// with gradient 0; queries at or after the last observation carry the last
    /// value with gradient 0.
    pub fn segment_at(&self, time: f64) -> Result<SegmentInfo, CovariateError> {
        let first_time = *self.times.first().ok_or(CovariateError::MissingSegments)?;
        if time < first_time {
            return Ok(SegmentInfo {
                from: first_time,
                value: self.values[0],
                gradient: 0.0,
            });
        }

        if let Some(segment) = self.segments.iter().find(|segment| segment.in_interval(time)) {
            return Ok(segment.info());
        }

        // At or past the last observation
        let last = self.times.len() - 1;
        Ok(SegmentInfo {
            from: self.times[last],
            value: self.values[last],
            gradient: 0.0,
        })
    }

    /// Get the name of the covariate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the observation times
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Get the observed values
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Check if this covariate uses carry-forward interpolation
    pub fn fixed(&self) -> bool {
        self.fixed
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Covariate '{}':", self.name)?;
        for (index, segment) in self.segments.iter().enumerate() {
            write!(
                f,
                "  Segment {}: from {:.2} to {:.2}, ",
                index + 1,
                segment.from,
                segment.to
            )?;
            match &segment.method {
                Interpolation::Linear { slope, intercept } => {
                    writeln!(f, "Linear, Slope: {:.2}, Intercept: {:.2}", slope, intercept)
                }
                Interpolation::CarryForward { value } => {
                    writeln!(f, "Carry Forward, Value: {:.2}", value)
                }
            }?;
        }
        Ok(())
    }
}

/// A collection of [Covariate]s, keyed by name
#[derive(Serialize, Clone, Debug, Deserialize, Default)]
pub struct Covariates {
    covariates: BTreeMap<String, Covariate>,
}

impl Covariates {
    /// Create a new empty collection of covariates
    pub fn new() -> Self {
        Covariates {
            covariates: BTreeMap::new(),
        }
    }

    /// Add a covariate to the collection, replacing any previous entry with
    /// the same name
    pub fn add_covariate(&mut self, covariate: Covariate) {
        self.covariates
            .insert(covariate.name().to_string(), covariate);
    }

    /// Add a covariate to the collection, builder style
    pub fn with_covariate(mut self, covariate: Covariate) -> Self {
        self.add_covariate(covariate);
        self
    }

    /// Get access to a specific covariate by name
    pub fn get_covariate(&self, name: &str) -> Option<&Covariate> {
        self.covariates.get(name)
    }

    /// Names of all covariates in the collection
    pub fn names(&self) -> Vec<&str> {
        self.covariates.keys().map(|name| name.as_str()).collect()
    }

    /// Number of covariates in the collection
    pub fn len(&self) -> usize {
        self.covariates.len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Covariates:")?;
        for covariate in self.covariates.values() {
            writeln!(f, "{}", covariate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_interpolation() {
        let cov = Covariate::linear("weight", vec![0.0, 10.0], vec![0.0, 10.0]).unwrap();

        assert_eq!(cov.interpolate(0.0).unwrap(), 0.0);
        assert_eq!(cov.interpolate(5.0).unwrap(), 5.0);
        assert_eq!(cov.interpolate(10.0).unwrap(), 10.0);
        // Carried forward past the last observation
        assert_eq!(cov.interpolate(15.0).unwrap(), 10.0);
    }

    #[test]
    fn test_linear_midpoint() {
        let cov = Covariate::linear("wt", vec![0.0, 12.0], vec![70.0, 74.0]).unwrap();
        assert_relative_eq!(cov.interpolate(6.0).unwrap(), 72.0);
    }

    #[test]
    fn test_carry_forward() {
        let cov = Covariate::carry_forward("crcl", vec![0.0, 12.0, 24.0], vec![90.0, 60.0, 80.0])
            .unwrap();

        assert_eq!(cov.interpolate(0.0).unwrap(), 90.0);
        assert_eq!(cov.interpolate(11.9).unwrap(), 90.0);
        assert_eq!(cov.interpolate(12.0).unwrap(), 60.0);
        assert_eq!(cov.interpolate(23.0).unwrap(), 60.0);
        assert_eq!(cov.interpolate(100.0).unwrap(), 80.0);
    }

    #[test]
    fn test_clamp_before_first_observation() {
        let cov = Covariate::linear("wt", vec![10.0, 20.0], vec![70.0, 80.0]).unwrap();
        let info = cov.segment_at(5.0).unwrap();
        assert_eq!(info.value, 70.0);
        assert_eq!(info.gradient, 0.0);
        assert_eq!(cov.interpolate(5.0).unwrap(), 70.0);
    }

    #[test]
    fn test_segment_gradient() {
        let cov = Covariate::linear("wt", vec![0.0, 12.0, 24.0], vec![70.0, 72.0, 75.0]).unwrap();

        let info = cov.segment_at(6.0).unwrap();
        assert_eq!(info.from, 0.0);
        assert_eq!(info.value, 70.0);
        assert_relative_eq!(info.gradient, 2.0 / 12.0);

        let info = cov.segment_at(18.0).unwrap();
        assert_eq!(info.from, 12.0);
        assert_relative_eq!(info.value, 72.0);
        assert_relative_eq!(info.gradient, 3.0 / 12.0);

        // Past the last observation the gradient is pinned to zero
        let info = cov.segment_at(30.0).unwrap();
        assert_eq!(info.from, 24.0);
        assert_eq!(info.value, 75.0);
        assert_eq!(info.gradient, 0.0);
    }

    #[test]
    fn test_carry_forward_gradient_is_zero() {
        let cov = Covariate::carry_forward("age", vec![0.0, 10.0], vec![35.0, 36.0]).unwrap();
        let info = cov.segment_at(5.0).unwrap();
        assert_eq!(info.gradient, 0.0);
        assert_eq!(info.value, 35.0);
    }

    #[test]
    fn test_invalid_series() {
        assert!(matches!(
            Covariate::linear("wt", vec![0.0, 1.0], vec![70.0]),
            Err(CovariateError::LengthMismatch { .. })
        ));
        assert!(matches!(
            Covariate::linear("wt", vec![], vec![]),
            Err(CovariateError::Empty { .. })
        ));
        assert!(matches!(
            Covariate::linear("wt", vec![0.0, 0.0], vec![70.0, 71.0]),
            Err(CovariateError::NonIncreasingTimes { .. })
        ));
    }

    #[test]
    fn test_covariates_collection() {
        let covariates = Covariates::new()
            .with_covariate(Covariate::linear("weight", vec![0.0, 24.0], vec![70.0, 75.0]).unwrap())
            .with_covariate(Covariate::constant("age", 35.0));

        assert_eq!(covariates.len(), 2);
        assert_eq!(covariates.names(), vec!["age", "weight"]);
        assert_eq!(
            covariates
                .get_covariate("weight")
                .unwrap()
                .interpolate(12.0)
                .unwrap(),
            72.5
        );
        assert_eq!(
            covariates
                .get_covariate("age")
                .unwrap()
                .interpolate(100.0)
                .unwrap(),
            35.0
        );
    }
}
