use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Error type for regimen construction
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RegimenError {
    #[error("either explicit dose times or a dosing interval must be provided")]
    MissingTiming,
    #[error("a dosing interval requires a dose count")]
    MissingCount,
    #[error("`{field}` has length {found}, expected 1 or {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("infusion dose at time {time} requires a positive duration")]
    MissingDuration { time: f64 },
    #[error("dose compartments are numbered from 1")]
    CompartmentIndex,
    #[error("dosing interval must be positive, got {interval}")]
    InvalidInterval { interval: f64 },
}

/// Route of administration for a dose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseType {
    /// Instantaneous addition to the target compartment
    Bolus,
    /// Instantaneous addition to the target (absorption) compartment
    Oral,
    /// Constant-rate addition over a finite duration
    Infusion,
}

impl DoseType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "bolus" | "iv" => Some(DoseType::Bolus),
            "oral" => Some(DoseType::Oral),
            "infusion" => Some(DoseType::Infusion),
            _ => None,
        }
    }
}

/// A single dose event in a [Regimen]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dose {
    time: f64,
    amount: f64,
    dose_type: DoseType,
    duration: Option<f64>,
    input: Option<usize>,
}

impl Dose {
    /// Time of administration
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Amount of drug administered
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Route of administration
    pub fn dose_type(&self) -> DoseType {
        self.dose_type
    }

    /// Infusion duration; `None` for bolus and oral doses
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Target compartment (zero-indexed); `None` falls back to the model's
    /// default dosing compartment
    pub fn input(&self) -> Option<usize> {
        self.input
    }
}

/// A population-level dose regimen
///
/// A [Regimen] is an ordered list of dose events, shared by every simulated
/// individual. Construct one through [Regimen::builder]; regimens are immutable
/// once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Regimen {
    doses: Vec<Dose>,
    /// Calendar timestamp of the first dose; metadata only, never used by the
    /// simulation itself
    first_dose: Option<DateTime<Utc>>,
}

impl Regimen {
    /// Create a [RegimenBuilder]
    pub fn builder() -> RegimenBuilder {
        RegimenBuilder::default()
    }

    /// All doses, ordered by time
    pub fn doses(&self) -> &[Dose] {
        &self.doses
    }

    /// Dose times, ordered
    pub fn times(&self) -> Vec<f64> {
        self.doses.iter().map(|dose| dose.time).collect()
    }

    /// Calendar timestamp of the first dose, if recorded
    pub fn first_dose(&self) -> Option<DateTime<Utc>> {
        self.first_dose
    }

    /// Number of doses
    pub fn len(&self) -> usize {
        self.doses.len()
    }

    /// Check if the regimen has no doses
    pub fn is_empty(&self) -> bool {
        self.doses.is_empty()
    }

    /// Time of the last scheduled event, including the end of the last infusion
    pub fn last_event_time(&self) -> f64 {
        self.doses
            .iter()
            .map(|dose| dose.time + dose.duration.unwrap_or(0.0))
            .fold(0.0, f64::max)
    }

    /// Default simulation horizon: the last event time plus the largest
    /// inter-dose gap
    ///
    /// This is a heuristic carried over from common practice, not a guarantee
    /// of adequacy for irregular regimens. With fewer than two doses the gap is
    /// unknown and 24 time units are added instead.
    pub fn default_horizon(&self) -> f64 {
        let gap = self
            .doses
            .windows(2)
            .map(|pair| pair[1].time - pair[0].time)
            .fold(0.0, f64::max);
        let tail = if gap > 0.0 { gap } else { 24.0 };
        self.last_event_time() + tail
    }
}

/// Builder for [Regimen]
///
/// Dose times come either from explicit `times` or from an `interval` plus a
/// dose count `n`. Amounts, dose types, durations and compartments are each
/// given once (applied to every dose) or per dose.
#[derive(Debug, Clone, Default)]
pub struct RegimenBuilder {
    amounts: Vec<Option<f64>>,
    times: Option<Vec<f64>>,
    interval: Option<f64>,
    n: Option<usize>,
    types: Vec<Option<String>>,
    durations: Vec<Option<f64>>,
    compartments: Vec<Option<usize>>,
    first_dose: Option<DateTime<Utc>>,
}

impl RegimenBuilder {
    /// Set a single dose amount, applied to every dose
    pub fn amount(mut self, amount: f64) -> Self {
        self.amounts = vec![Some(amount)];
        self
    }

    /// Set per-dose amounts; `None` entries mark undefined doses, which are
    /// dropped at build time
    pub fn amounts(mut self, amounts: Vec<Option<f64>>) -> Self {
        self.amounts = amounts;
        self
    }

    /// Set explicit dose times
    pub fn times(mut self, times: Vec<f64>) -> Self {
        self.times = Some(times);
        self
    }

    /// Set the inter-dose interval; requires [RegimenBuilder::n]
    pub fn interval(mut self, interval: f64) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the number of doses for an interval-based regimen
    pub fn n(mut self, n: usize) -> Self {
        self.n = Some(n);
        self
    }

    /// Set the dose type for every dose (`"bolus"`, `"oral"` or `"infusion"`)
    pub fn dose_type(mut self, dose_type: impl Into<String>) -> Self {
        self.types = vec![Some(dose_type.into())];
        self
    }

    /// Set per-dose types
    pub fn dose_types(mut self, types: Vec<Option<String>>) -> Self {
        self.types = types;
        self
    }

    /// Set a single infusion duration, applied to every dose
    ///
    /// Providing a duration without a dose type marks the doses as infusions.
    pub fn duration(mut self, duration: f64) -> Self {
        self.durations = vec![Some(duration)];
        self
    }

    /// Set per-dose infusion durations
    pub fn durations(mut self, durations: Vec<Option<f64>>) -> Self {
        self.durations = durations;
        self
    }

    /// Set the target compartment for every dose (numbered from 1); doses
    /// without a compartment go to the model's default dosing compartment
    pub fn compartment(mut self, compartment: usize) -> Self {
        self.compartments = vec![Some(compartment)];
        self
    }

    /// Set per-dose target compartments (numbered from 1)
    pub fn compartments(mut self, compartments: Vec<usize>) -> Self {
        self.compartments = compartments.into_iter().map(Some).collect();
        self
    }

    /// Record the calendar timestamp of the first dose (metadata only)
    pub fn first_dose(mut self, first_dose: DateTime<Utc>) -> Self {
        self.first_dose = Some(first_dose);
        self
    }

    /// Validate the inputs and build the [Regimen]
    pub fn build(self) -> Result<Regimen, RegimenError> {
        let times = match (self.times, self.interval) {
            (Some(times), _) => times,
            (None, Some(interval)) => {
                if interval <= 0.0 {
                    return Err(RegimenError::InvalidInterval { interval });
                }
                let n = self.n.ok_or(RegimenError::MissingCount)?;
                (0..n).map(|i| i as f64 * interval).collect()
            }
            (None, None) => return Err(RegimenError::MissingTiming),
        };
        let n_doses = times.len();

        let amounts = broadcast("amount", &self.amounts, n_doses)?;
        let types = broadcast("type", &self.types, n_doses)?;
        let durations = broadcast("duration", &self.durations, n_doses)?;
        let compartments = broadcast("compartment", &self.compartments, n_doses)?;

        let mut doses = Vec::with_capacity(n_doses);
        let mut dropped = 0usize;
        for i in 0..n_doses {
            let amount = match amounts[i] {
                Some(amount) => amount,
                None => {
                    dropped += 1;
                    continue;
                }
            };
            let time = times[i];
            let duration = durations[i].filter(|d| *d > 0.0);

            let dose_type = match (&types[i], duration) {
                (Some(raw), duration) => match DoseType::parse(raw) {
                    Some(DoseType::Infusion) => {
                        if duration.is_none() {
                            return Err(RegimenError::MissingDuration { time });
                        }
                        DoseType::Infusion
                    }
                    Some(parsed) => parsed,
                    None => {
                        if duration.is_some() {
                            warn!(dose_type = %raw, "unrecognized dose type, inferring infusion from duration");
                            DoseType::Infusion
                        } else {
                            warn!(dose_type = %raw, "unrecognized dose type, defaulting to bolus");
                            DoseType::Bolus
                        }
                    }
                },
                (None, Some(_)) => DoseType::Infusion,
                (None, None) => DoseType::Bolus,
            };

            let input = match compartments[i] {
                Some(0) => return Err(RegimenError::CompartmentIndex),
                Some(compartment) => Some(compartment - 1),
                None => None,
            };

            doses.push(Dose {
                time,
                amount,
                dose_type,
                duration: if dose_type == DoseType::Infusion {
                    duration
                } else {
                    None
                },
                input,
            });
        }
        if dropped > 0 {
            warn!(dropped, "dropped doses with undefined amounts");
        }

        doses.sort_by(|a, b| a.time.total_cmp(&b.time));

        Ok(Regimen {
            doses,
            first_dose: self.first_dose,
        })
    }
}

/// Broadcast a scalar-or-per-dose input to the dose count
fn broadcast<T: Clone + Default>(
    field: &'static str,
    input: &[T],
    n_doses: usize,
) -> Result<Vec<T>, RegimenError> {
    match input.len() {
        0 => Ok(vec![T::default(); n_doses]),
        1 => Ok(vec![input[0].clone(); n_doses]),
        len if len == n_doses => Ok(input.to_vec()),
        len => Err(RegimenError::LengthMismatch {
            field,
            expected: n_doses,
            found: len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_regimen_times() {
        let regimen = Regimen::builder()
            .amount(100.0)
            .interval(12.0)
            .n(4)
            .build()
            .unwrap();
        assert_eq!(regimen.times(), vec![0.0, 12.0, 24.0, 36.0]);
        assert_eq!(regimen.len(), 4);
        for dose in regimen.doses() {
            assert_eq!(dose.amount(), 100.0);
            assert_eq!(dose.dose_type(), DoseType::Bolus);
            assert_eq!(dose.input(), None);
        }
    }

    #[test]
    fn test_explicit_times_preserved() {
        let times = vec![0.0, 1.5, 7.25, 30.0];
        let regimen = Regimen::builder()
            .amount(50.0)
            .times(times.clone())
            .build()
            .unwrap();
        assert_eq!(regimen.times(), times);
    }

    #[test]
    fn test_undefined_amounts_dropped() {
        let regimen = Regimen::builder()
            .amounts(vec![Some(100.0), None, Some(50.0)])
            .times(vec![0.0, 12.0, 24.0])
            .build()
            .unwrap();
        assert_eq!(regimen.len(), 2);
        assert_eq!(regimen.times(), vec![0.0, 24.0]);
    }

    #[test]
    fn test_missing_timing_is_fatal() {
        let result = Regimen::builder().amount(100.0).build();
        assert!(matches!(result, Err(RegimenError::MissingTiming)));
    }

    #[test]
    fn test_interval_without_count_is_fatal() {
        let result = Regimen::builder().amount(100.0).interval(12.0).build();
        assert!(matches!(result, Err(RegimenError::MissingCount)));
    }

    #[test]
    fn test_duration_infers_infusion() {
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .duration(2.0)
            .build()
            .unwrap();
        assert_eq!(regimen.doses()[0].dose_type(), DoseType::Infusion);
        assert_eq!(regimen.doses()[0].duration(), Some(2.0));
    }

    #[test]
    fn test_unrecognized_type_defaults_to_bolus() {
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .dose_type("sc")
            .build()
            .unwrap();
        assert_eq!(regimen.doses()[0].dose_type(), DoseType::Bolus);
    }

    #[test]
    fn test_infusion_without_duration_is_fatal() {
        let result = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .dose_type("infusion")
            .build();
        assert!(matches!(result, Err(RegimenError::MissingDuration { .. })));
    }

    #[test]
    fn test_length_mismatch_is_fatal() {
        let result = Regimen::builder()
            .amounts(vec![Some(100.0), Some(50.0)])
            .times(vec![0.0, 12.0, 24.0])
            .build();
        assert!(matches!(
            result,
            Err(RegimenError::LengthMismatch {
                field: "amount",
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn test_compartment_is_one_based() {
        let result = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .compartment(0)
            .build();
        assert!(matches!(result, Err(RegimenError::CompartmentIndex)));

        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .compartment(2)
            .build()
            .unwrap();
        assert_eq!(regimen.doses()[0].input(), Some(1));
    }

    #[test]
    fn test_unsorted_times_are_ordered() {
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![24.0, 0.0, 12.0])
            .build()
            .unwrap();
        assert_eq!(regimen.times(), vec![0.0, 12.0, 24.0]);
    }

    #[test]
    fn test_default_horizon() {
        let regimen = Regimen::builder()
            .amount(100.0)
            .interval(12.0)
            .n(3)
            .build()
            .unwrap();
        // Last dose at 24, largest gap 12
        assert_eq!(regimen.default_horizon(), 36.0);

        let single = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .build()
            .unwrap();
        assert_eq!(single.default_horizon(), 24.0);
    }

    #[test]
    fn test_first_dose_is_metadata_only() {
        let stamp = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let regimen = Regimen::builder()
            .amount(100.0)
            .times(vec![0.0])
            .first_dose(stamp)
            .build()
            .unwrap();
        assert_eq!(regimen.first_dose(), Some(stamp));
        assert_eq!(regimen.times(), vec![0.0]);
    }
}
