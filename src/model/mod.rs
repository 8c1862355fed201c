pub mod ast;
pub mod compiler;
mod eval;
pub mod library;
mod parser;

use cached::proc_macro::cached;
use cached::UnboundCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::data::covariate::SegmentInfo;
use crate::model::ast::{Expr, KernelStmt};
use crate::simulator::{T, V};
pub use compiler::SpecificationError;

/// The measurable output of a model: a compartment and a scale expression
///
/// The reported observation is the compartment amount divided by the evaluated
/// scale (classically a volume term, optionally covariate-dependent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationSpec {
    /// Observed compartment, numbered from 1
    pub compartment: usize,
    /// Scale expression, e.g. `"v"` or `"v * wt / 70"`
    pub scale: String,
}

/// A symbolic model specification
///
/// A [ModelSpec] holds the derivative equations (one or more fragments merged
/// in declaration order), optional state-initialization statements, the
/// parameter and covariate name sets, an optional observation definition and
/// the default dosing compartment. Compartments are numbered from 1 in the
/// equation text (`x[1]`, `dx[1]`); the compiler normalizes them to the
/// zero-indexed convention used internally.
///
/// # Example
///
/// ```
/// use dosesim::ModelSpec;
///
/// let spec = ModelSpec::builder()
///     .equation("dx[1] = -ka * x[1]; dx[2] = ka * x[1] - ke * x[2];")
///     .parameters(["ka", "ke", "v"])
///     .observe(2, "v")
///     .build();
/// let model = spec.compile().unwrap();
/// assert_eq!(model.nstates(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    equations: Vec<String>,
    #[serde(default)]
    init: Option<String>,
    parameters: Vec<String>,
    #[serde(default)]
    covariates: Vec<String>,
    #[serde(default)]
    observation: Option<ObservationSpec>,
    #[serde(default = "default_dose_compartment")]
    dose_compartment: usize,
}

fn default_dose_compartment() -> usize {
    1
}

impl ModelSpec {
    /// Create a [ModelSpecBuilder]
    pub fn builder() -> ModelSpecBuilder {
        ModelSpecBuilder::default()
    }

    /// Load a specification from JSON text
    pub fn from_json(text: &str) -> Result<Self, SpecificationError> {
        serde_json::from_str(text).map_err(|e| SpecificationError::Json(e.to_string()))
    }

    /// Look up a named specification from the built-in model library
    pub fn from_library(name: &str) -> Result<Self, SpecificationError> {
        library::get(name).ok_or_else(|| SpecificationError::UnknownLibraryModel {
            name: name.to_string(),
        })
    }

    /// Compile this specification into an executable [Model]
    ///
    /// Compilation is memoized: each distinct specification is compiled exactly
    /// once per process and the artifact is reused across simulations.
    pub fn compile(&self) -> Result<Model, SpecificationError> {
        compile_cached(self)
    }

    /// Equation fragments, in declaration order
    pub fn equations(&self) -> &[String] {
        &self.equations
    }

    /// State-initialization statements, if any
    pub fn init(&self) -> Option<&str> {
        self.init.as_deref()
    }

    /// Declared parameter names, in declaration order
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Declared covariate names
    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    /// The observation definition, if any
    pub fn observation(&self) -> Option<&ObservationSpec> {
        self.observation.as_ref()
    }

    /// Default dosing compartment, numbered from 1
    pub fn dose_compartment(&self) -> usize {
        self.dose_compartment
    }
}

/// Builder for [ModelSpec]
#[derive(Debug, Clone)]
pub struct ModelSpecBuilder {
    equations: Vec<String>,
    init: Option<String>,
    parameters: Vec<String>,
    covariates: Vec<String>,
    observation: Option<ObservationSpec>,
    dose_compartment: usize,
}

impl Default for ModelSpecBuilder {
    fn default() -> Self {
        ModelSpecBuilder {
            equations: Vec::new(),
            init: None,
            parameters: Vec::new(),
            covariates: Vec::new(),
            observation: None,
            dose_compartment: 1,
        }
    }
}

impl ModelSpecBuilder {
    /// Append an equation fragment; fragments are merged in the order given
    pub fn equation(mut self, text: impl Into<String>) -> Self {
        self.equations.push(text.into());
        self
    }

    /// Set the state-initialization statements (e.g. `"x[1] = kin / kout;"`)
    pub fn init(mut self, text: impl Into<String>) -> Self {
        self.init = Some(text.into());
        self
    }

    /// Set the parameter names; declaration order determines both the kernel
    /// parameter indices and the order in which between-subject variability
    /// applies
    pub fn parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a covariate name
    pub fn covariate(mut self, name: impl Into<String>) -> Self {
        self.covariates.push(name.into());
        self
    }

    /// Declare several covariate names
    pub fn covariates<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates.extend(names.into_iter().map(Into::into));
        self
    }

    /// Define the observation: a compartment (numbered from 1) and a scale
    /// expression
    pub fn observe(mut self, compartment: usize, scale: impl Into<String>) -> Self {
        self.observation = Some(ObservationSpec {
            compartment,
            scale: scale.into(),
        });
        self
    }

    /// Set the default dosing compartment (numbered from 1)
    pub fn dose_compartment(mut self, compartment: usize) -> Self {
        self.dose_compartment = compartment;
        self
    }

    /// Build the [ModelSpec]; validation happens at compile time
    pub fn build(self) -> ModelSpec {
        ModelSpec {
            equations: self.equations,
            init: self.init,
            parameters: self.parameters,
            covariates: self.covariates,
            observation: self.observation,
            dose_compartment: self.dose_compartment,
        }
    }
}

/// Compiled observation definition: zero-indexed compartment + scale AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CompiledObservation {
    pub(crate) compartment: usize,
    pub(crate) scale: Expr,
}

/// Per-segment covariate bindings for the kernel
///
/// The simulation driver refreshes these once per integration segment from the
/// covariate interpolator; inside the segment the kernel evaluates each
/// covariate as `value + gradient * (t - from)`, so covariate slope changes
/// only ever happen at segment boundaries.
#[derive(Debug, Clone, Default)]
pub struct CovariateRuntime {
    bindings: HashMap<String, SegmentInfo>,
}

impl CovariateRuntime {
    /// Create an empty runtime (models without covariates)
    pub fn new() -> Self {
        CovariateRuntime {
            bindings: HashMap::new(),
        }
    }

    /// Bind a covariate to its current interpolation segment
    pub fn bind(&mut self, name: impl Into<String>, segment: SegmentInfo) {
        self.bindings.insert(name.into(), segment);
    }

    /// Evaluate a bound covariate at time `t`
    #[inline]
    pub(crate) fn value(&self, name: &str, t: T) -> f64 {
        match self.bindings.get(name) {
            Some(segment) => segment.value + segment.gradient * (t - segment.from),
            // Unbound names are rejected at compile/run start
            None => 0.0,
        }
    }
}

/// A compiled model kernel
///
/// The executable artifact produced by [ModelSpec::compile]: index-normalized
/// statements with the infusion-rate term injected, resolved parameter and
/// covariate references, the compiled observation and a diagnostic listing.
/// A [Model] is immutable and shared read-only across individuals during a
/// simulation.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) dynamics: Vec<KernelStmt>,
    pub(crate) init: Vec<KernelStmt>,
    pub(crate) observation: Option<CompiledObservation>,
    pub(crate) parameters: Vec<String>,
    pub(crate) covariates: Vec<String>,
    pub(crate) aux: Vec<String>,
    pub(crate) init_aux: Vec<String>,
    pub(crate) nstates: usize,
    pub(crate) dose_compartment: usize,
    pub(crate) listing: String,
}

impl Model {
    /// Number of compartments (state variables)
    pub fn nstates(&self) -> usize {
        self.nstates
    }

    /// Declared parameter names, in kernel order
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Covariate names referenced by the kernel
    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    /// Default dosing compartment (zero-indexed)
    pub fn dose_compartment(&self) -> usize {
        self.dose_compartment
    }

    /// The generated kernel as text, for diagnostics
    pub fn listing(&self) -> &str {
        &self.listing
    }

    /// Evaluate the derivative kernel
    ///
    /// # Arguments
    ///
    /// * `x` - State vector at time `t`
    /// * `t` - Evaluation time
    /// * `p` - Parameter vector, in declaration order
    /// * `rates` - Per-compartment infusion rates for the current segment
    /// * `covariates` - Per-segment covariate bindings
    /// * `dx` - Output derivative vector
    pub fn derivatives(
        &self,
        x: &V,
        t: T,
        p: &V,
        rates: &V,
        covariates: &CovariateRuntime,
        dx: &mut V,
    ) {
        eval::eval_kernel(&self.dynamics, &self.aux, x, p, t, rates, covariates, dx);
    }

    /// Evaluate the state-initialization statements at `t = 0`
    ///
    /// Compartments without an init expression start at zero. Later statements
    /// see the states written by earlier ones.
    pub(crate) fn initial_state(&self, p: &V, covariates: &CovariateRuntime) -> V {
        let mut x = V::zeros(self.nstates);
        let rates = V::zeros(self.nstates);
        let mut locals: HashMap<String, f64> = self
            .init_aux
            .iter()
            .map(|name| (name.clone(), 0.0))
            .collect();
        for statement in &self.init {
            match statement {
                KernelStmt::Aux { name, expr } => {
                    let value = eval::eval_expr(expr, &x, p, 0.0, &rates, &locals, covariates);
                    locals.insert(name.clone(), value);
                }
                KernelStmt::Compartment { index, expr } => {
                    let value = eval::eval_expr(expr, &x, p, 0.0, &rates, &locals, covariates);
                    x[*index] = value;
                }
            }
        }
        x
    }

    /// Evaluate the observation scale at a trajectory point
    pub(crate) fn scale_at(&self, x: &V, t: T, p: &V, covariates: &CovariateRuntime) -> Option<f64> {
        self.observation.as_ref().map(|obs| {
            let rates = V::zeros(self.nstates);
            eval::eval_expr(&obs.scale, x, p, t, &rates, &HashMap::new(), covariates)
        })
    }
}

/// Fingerprint a specification for the compile cache
fn spec_fingerprint(spec: &ModelSpec) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    spec.hash(&mut hasher);
    hasher.finish()
}

#[cached(
    ty = "UnboundCache<u64, Model>",
    create = "{ UnboundCache::with_capacity(64) }",
    convert = r#"{ spec_fingerprint(spec) }"#,
    result = "true"
)]
fn compile_cached(spec: &ModelSpec) -> Result<Model, SpecificationError> {
    compiler::compile(spec)
}
