//! Translation of a [ModelSpec](crate::ModelSpec) into a compiled kernel.
//!
//! The compiler parses the symbolic equations, scans for auxiliary variables,
//! normalizes the user-facing 1-based compartment indices to the 0-based
//! convention used by the kernel, injects the per-compartment infusion-rate
//! term into every derivative, resolves parameter and covariate references,
//! and produces an immutable [Model](crate::Model) artifact.
use thiserror::Error;
use tracing::debug;

use crate::model::ast::{BinOp, Expr, KernelStmt, Lhs, Stmt};
use crate::model::eval::builtin_arity;
use crate::model::{CompiledObservation, Model, ModelSpec};
use crate::model::parser;

/// Error type for model compilation
///
/// Every condition here is fatal: a specification that fails to compile is
/// never partially usable.
#[derive(Error, Debug, Clone)]
pub enum SpecificationError {
    #[error("failed to parse model equations: {0}")]
    Parse(String),
    #[error("model defines no derivative equations")]
    NoDerivatives,
    #[error("compartment indices are 1-based: `{name}[0]` is not a valid reference")]
    ZeroIndex { name: String },
    #[error("state reference x[{index}] exceeds the {nstates} model compartment(s)")]
    StateOutOfRange { index: usize, nstates: usize },
    #[error("no derivative equation assigns to compartment {compartment}")]
    MissingDerivative { compartment: usize },
    #[error("duplicate derivative equation for compartment {compartment}")]
    DuplicateDerivative { compartment: usize },
    #[error("model equations reference `rate` directly; infusion rates are injected automatically")]
    ManualRate,
    #[error("derivative values cannot be read inside model equations")]
    DerivativeRead,
    #[error("derivative assignments are not allowed in state initialization")]
    DerivativeInInit,
    #[error("state assignments are only allowed in state initialization")]
    StateAssignmentInDynamics,
    #[error("cannot assign to `{name}`")]
    InvalidAssignment { name: String },
    #[error("unresolved reference `{name}`: not a parameter, auxiliary variable or declared covariate")]
    UnresolvedReference { name: String },
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("`{name}` expects {expected} argument(s), found {found}")]
    WrongArity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("observation compartment {compartment} is not one of the {nstates} model compartment(s)")]
    ObservationOutOfRange { compartment: usize, nstates: usize },
    #[error("dose compartment {compartment} is not one of the {nstates} model compartment(s)")]
    DoseCompartmentOutOfRange { compartment: usize, nstates: usize },
    #[error("unknown library model `{name}`")]
    UnknownLibraryModel { name: String },
    #[error("invalid model JSON: {0}")]
    Json(String),
}

/// Rewrites unresolved identifiers into typed AST nodes
struct Resolver<'a> {
    spec: &'a ModelSpec,
    aux: &'a [String],
    nstates: usize,
    used_covariates: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn new(spec: &'a ModelSpec, aux: &'a [String], nstates: usize) -> Self {
        Resolver {
            spec,
            aux,
            nstates,
            used_covariates: Vec::new(),
        }
    }

    fn resolve(&mut self, expr: Expr) -> Result<Expr, SpecificationError> {
        match expr {
            Expr::Number(_)
            | Expr::Time
            | Expr::Param(_)
            | Expr::State(_)
            | Expr::Rate(_)
            | Expr::Covariate(_)
            | Expr::Aux(_) => Ok(expr),
            Expr::Ident(name) => {
                if name == "t" {
                    return Ok(Expr::Time);
                }
                if name == "rate" {
                    return Err(SpecificationError::ManualRate);
                }
                if let Some(index) = self
                    .spec
                    .parameters()
                    .iter()
                    .position(|parameter| *parameter == name)
                {
                    return Ok(Expr::Param(index));
                }
                if self.aux.contains(&name) {
                    return Ok(Expr::Aux(name));
                }
                if self.spec.covariates().iter().any(|cov| *cov == name) {
                    if !self.used_covariates.contains(&name) {
                        self.used_covariates.push(name.clone());
                    }
                    return Ok(Expr::Covariate(name));
                }
                Err(SpecificationError::UnresolvedReference { name })
            }
            Expr::Indexed { name, index } => match name.as_str() {
                "x" => {
                    if index == 0 {
                        Err(SpecificationError::ZeroIndex { name })
                    } else if index > self.nstates {
                        Err(SpecificationError::StateOutOfRange {
                            index,
                            nstates: self.nstates,
                        })
                    } else {
                        Ok(Expr::State(index - 1))
                    }
                }
                "rate" => Err(SpecificationError::ManualRate),
                "dx" => Err(SpecificationError::DerivativeRead),
                _ => Err(SpecificationError::UnresolvedReference { name }),
            },
            Expr::Neg(inner) => Ok(Expr::Neg(Box::new(self.resolve(*inner)?))),
            Expr::Binary { op, lhs, rhs } => Ok(Expr::Binary {
                op,
                lhs: Box::new(self.resolve(*lhs)?),
                rhs: Box::new(self.resolve(*rhs)?),
            }),
            Expr::Call { name, args } => {
                let expected = builtin_arity(&name)
                    .ok_or_else(|| SpecificationError::UnknownFunction { name: name.clone() })?;
                if args.len() != expected {
                    return Err(SpecificationError::WrongArity {
                        name,
                        expected,
                        found: args.len(),
                    });
                }
                let args = args
                    .into_iter()
                    .map(|arg| self.resolve(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::Call { name, args })
            }
        }
    }
}

/// Collect auxiliary variable names (assignment targets that are not
/// derivative or state assignments), rejecting reserved and declared names
fn scan_aux(spec: &ModelSpec, statements: &[Stmt]) -> Result<Vec<String>, SpecificationError> {
    let mut aux: Vec<String> = Vec::new();
    for statement in statements {
        if let Lhs::Ident(name) = &statement.lhs {
            if name == "t" || name == "rate" || name == "x" || name == "dx" {
                if name == "rate" {
                    return Err(SpecificationError::ManualRate);
                }
                return Err(SpecificationError::InvalidAssignment { name: name.clone() });
            }
            if spec.parameters().iter().any(|parameter| parameter == name)
                || spec.covariates().iter().any(|covariate| covariate == name)
            {
                return Err(SpecificationError::InvalidAssignment { name: name.clone() });
            }
            if !aux.contains(name) {
                aux.push(name.clone());
            }
        }
    }
    Ok(aux)
}

pub(crate) fn compile(spec: &ModelSpec) -> Result<Model, SpecificationError> {
    let merged = spec.equations().join("\n");
    let statements =
        parser::parse_statements(&merged).map_err(|e| SpecificationError::Parse(e.to_string()))?;

    // Pass 1: auxiliary scan and compartment count
    let aux = scan_aux(spec, &statements)?;
    let mut derivative_targets: Vec<usize> = Vec::new();
    for statement in &statements {
        match &statement.lhs {
            Lhs::Indexed { name, index } => match name.as_str() {
                "dx" => {
                    if *index == 0 {
                        return Err(SpecificationError::ZeroIndex { name: name.clone() });
                    }
                    if derivative_targets.contains(index) {
                        return Err(SpecificationError::DuplicateDerivative {
                            compartment: *index,
                        });
                    }
                    derivative_targets.push(*index);
                }
                "rate" => return Err(SpecificationError::ManualRate),
                "x" => return Err(SpecificationError::StateAssignmentInDynamics),
                _ => {
                    return Err(SpecificationError::InvalidAssignment { name: name.clone() })
                }
            },
            Lhs::Ident(_) => {}
        }
    }
    let nstates = derivative_targets
        .iter()
        .copied()
        .max()
        .ok_or(SpecificationError::NoDerivatives)?;
    for compartment in 1..=nstates {
        if !derivative_targets.contains(&compartment) {
            return Err(SpecificationError::MissingDerivative { compartment });
        }
    }

    // Pass 2: resolve references and inject the infusion-rate term
    let mut resolver = Resolver::new(spec, &aux, nstates);
    let mut dynamics = Vec::with_capacity(statements.len());
    for statement in statements {
        let rhs = resolver.resolve(statement.rhs)?;
        match statement.lhs {
            Lhs::Ident(name) => dynamics.push(KernelStmt::Aux { name, expr: rhs }),
            Lhs::Indexed { index, .. } => {
                // dx[k]: append the per-compartment infusion rate
                let expr = Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(rhs),
                    rhs: Box::new(Expr::Rate(index - 1)),
                };
                dynamics.push(KernelStmt::Compartment {
                    index: index - 1,
                    expr,
                });
            }
        }
    }

    // Pass 3: state initialization
    let mut init = Vec::new();
    let mut init_aux = Vec::new();
    if let Some(init_text) = spec.init() {
        let init_statements = parser::parse_statements(init_text)
            .map_err(|e| SpecificationError::Parse(e.to_string()))?;
        init_aux = scan_aux(spec, &init_statements)?;
        let mut init_resolver = Resolver::new(spec, &init_aux, nstates);
        for statement in init_statements {
            let rhs = init_resolver.resolve(statement.rhs)?;
            match statement.lhs {
                Lhs::Ident(name) => init.push(KernelStmt::Aux { name, expr: rhs }),
                Lhs::Indexed { name, index } => match name.as_str() {
                    "x" => {
                        if index == 0 {
                            return Err(SpecificationError::ZeroIndex { name });
                        }
                        if index > nstates {
                            return Err(SpecificationError::StateOutOfRange {
                                index,
                                nstates,
                            });
                        }
                        init.push(KernelStmt::Compartment {
                            index: index - 1,
                            expr: rhs,
                        });
                    }
                    "dx" => return Err(SpecificationError::DerivativeInInit),
                    "rate" => return Err(SpecificationError::ManualRate),
                    _ => {
                        return Err(SpecificationError::InvalidAssignment { name })
                    }
                },
            }
        }
        for name in init_resolver.used_covariates {
            if !resolver.used_covariates.contains(&name) {
                resolver.used_covariates.push(name);
            }
        }
    }

    // Pass 4: observation injection
    let observation = match spec.observation() {
        Some(obs) => {
            if obs.compartment == 0 || obs.compartment > nstates {
                return Err(SpecificationError::ObservationOutOfRange {
                    compartment: obs.compartment,
                    nstates,
                });
            }
            let scale = parser::parse_expression(&obs.scale)
                .map_err(|e| SpecificationError::Parse(e.to_string()))?;
            // The scale is evaluated outside the kernel, so auxiliary locals
            // are not in scope here
            let mut scale_resolver = Resolver::new(spec, &[], nstates);
            let scale = scale_resolver.resolve(scale)?;
            for name in scale_resolver.used_covariates {
                if !resolver.used_covariates.contains(&name) {
                    resolver.used_covariates.push(name);
                }
            }
            Some(CompiledObservation {
                compartment: obs.compartment - 1,
                scale,
            })
        }
        None => None,
    };

    // Pass 5: dosing compartment
    let dose_compartment = spec.dose_compartment();
    if dose_compartment == 0 || dose_compartment > nstates {
        return Err(SpecificationError::DoseCompartmentOutOfRange {
            compartment: dose_compartment,
            nstates,
        });
    }

    let covariates = resolver.used_covariates;
    let listing = render_listing(spec, &covariates, &dynamics, &init, &observation);
    debug!(nstates, listing = %listing, "compiled model kernel");

    Ok(Model {
        dynamics,
        init,
        observation,
        parameters: spec.parameters().to_vec(),
        covariates,
        aux,
        init_aux,
        nstates,
        dose_compartment: dose_compartment - 1,
        listing,
    })
}

/// Render the generated kernel as text, for diagnostics
fn render_listing(
    spec: &ModelSpec,
    covariates: &[String],
    dynamics: &[KernelStmt],
    init: &[KernelStmt],
    observation: &Option<CompiledObservation>,
) -> String {
    let mut lines = Vec::new();
    let parameters = spec
        .parameters()
        .iter()
        .enumerate()
        .map(|(index, name)| format!("{} = p[{}]", name, index))
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(format!("// parameters: {}", parameters));
    for name in covariates {
        lines.push(format!(
            "{name} = seg_value[{name}] + seg_gradient[{name}] * (t - seg_start[{name}])"
        ));
    }
    for statement in init {
        match statement {
            KernelStmt::Aux { name, expr } => lines.push(format!("{} = {}", name, expr)),
            KernelStmt::Compartment { index, expr } => {
                lines.push(format!("x[{}] = {}", index, expr))
            }
        }
    }
    for statement in dynamics {
        match statement {
            KernelStmt::Aux { name, expr } => lines.push(format!("{} = {}", name, expr)),
            KernelStmt::Compartment { index, expr } => {
                lines.push(format!("dx[{}] = {}", index, expr))
            }
        }
    }
    if let Some(obs) = observation {
        lines.push(format!("obs = x[{}] / ({})", obs.compartment, obs.scale));
    }
    lines.join("\n")
}
