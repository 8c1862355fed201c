//! Translation of a [Regimen] into an ordered breakpoint timeline.
//!
//! Every discontinuous input (bolus addition, infusion rate toggle) becomes a
//! breakpoint; the driver integrates continuously between consecutive
//! breakpoints so that discontinuities never fall inside a single integrator
//! call.
use crate::data::regimen::{DoseType, Regimen};

/// A state mutation applied at a breakpoint, before the next segment starts
#[derive(Debug, Clone, PartialEq)]
pub enum StateMutation {
    /// Add an amount to a compartment (bolus and oral doses)
    Bolus { compartment: usize, amount: f64 },
    /// Start an infusion: add `rate` to the compartment's infusion rate
    RateOn { compartment: usize, rate: f64 },
    /// End an infusion: remove `rate` from the compartment's infusion rate
    RateOff { compartment: usize, rate: f64 },
}

/// A timeline instant at which discontinuous inputs take effect
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    time: f64,
    mutations: Vec<StateMutation>,
}

impl Breakpoint {
    /// Time of the breakpoint
    pub fn time(&self) -> f64 {
        self.time
    }

    /// State mutations applied at this breakpoint
    pub fn mutations(&self) -> &[StateMutation] {
        &self.mutations
    }
}

/// The breakpoint timeline for one simulation call
///
/// Built once per call and shared read-only across individuals.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    breakpoints: Vec<Breakpoint>,
    tmax: f64,
}

impl Timeline {
    /// Partition a regimen into a strictly time-ordered breakpoint timeline
    /// over `[0, tmax]`
    ///
    /// Doses without an explicit target compartment go to `default_input`
    /// (the model's default dosing compartment, zero-indexed). Doses scheduled
    /// at or after `tmax` are dropped. Each infusion start is paired with an
    /// auto-inserted end breakpoint at `start + duration`, clamped to `tmax`.
    /// A terminal breakpoint at `tmax` always exists, even for a regimen with
    /// no doses.
    pub fn build(regimen: &Regimen, tmax: f64, default_input: usize) -> Self {
        let mut events: Vec<(f64, StateMutation)> = Vec::new();
        for dose in regimen.doses() {
            if dose.time() >= tmax {
                continue;
            }
            let compartment = dose.input().unwrap_or(default_input);
            match dose.dose_type() {
                DoseType::Bolus | DoseType::Oral => {
                    events.push((
                        dose.time(),
                        StateMutation::Bolus {
                            compartment,
                            amount: dose.amount(),
                        },
                    ));
                }
                DoseType::Infusion => {
                    // The builder guarantees infusions carry a positive duration
                    let duration = dose.duration().unwrap_or(0.0);
                    let rate = dose.amount() / duration;
                    events.push((
                        dose.time(),
                        StateMutation::RateOn { compartment, rate },
                    ));
                    let end = (dose.time() + duration).min(tmax);
                    events.push((
                        end,
                        StateMutation::RateOff { compartment, rate },
                    ));
                }
            }
        }

        events.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut breakpoints: Vec<Breakpoint> = Vec::new();
        for (time, mutation) in events {
            match breakpoints.last_mut() {
                Some(last) if last.time == time => last.mutations.push(mutation),
                _ => breakpoints.push(Breakpoint {
                    time,
                    mutations: vec![mutation],
                }),
            }
        }

        // Terminal no-op marker
        match breakpoints.last() {
            Some(last) if last.time == tmax => {}
            _ => breakpoints.push(Breakpoint {
                time: tmax,
                mutations: Vec::new(),
            }),
        }

        Timeline { breakpoints, tmax }
    }

    /// The ordered breakpoints
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// The simulation horizon
    pub fn tmax(&self) -> f64 {
        self.tmax
    }
}
