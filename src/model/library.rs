//! Built-in library of standard PK model specifications
//!
//! Retrieve by name with [ModelSpec::from_library](crate::ModelSpec::from_library)
//! or call the constructors directly.
use crate::model::ModelSpec;

/// One-compartment model with intravenous input
///
/// Parameters: `ke` (elimination rate), `v` (volume). Observation: `x[1] / v`.
pub fn one_compartment() -> ModelSpec {
    ModelSpec::builder()
        .equation("dx[1] = -ke * x[1];")
        .parameters(["ke", "v"])
        .observe(1, "v")
        .build()
}

/// One-compartment model with first-order absorption
///
/// Parameters: `ka` (absorption rate), `ke`, `v`. Doses default into the
/// depot compartment; observation is the central compartment scaled by `v`.
pub fn one_compartment_with_absorption() -> ModelSpec {
    ModelSpec::builder()
        .equation("dx[1] = -ka * x[1]; dx[2] = ka * x[1] - ke * x[2];")
        .parameters(["ka", "ke", "v"])
        .observe(2, "v")
        .dose_compartment(1)
        .build()
}

/// Two-compartment model with intravenous input
///
/// Parameters: `ke`, `kcp`, `kpc`, `v`.
pub fn two_compartments() -> ModelSpec {
    ModelSpec::builder()
        .equation(
            "dx[1] = -(ke + kcp) * x[1] + kpc * x[2]; dx[2] = kcp * x[1] - kpc * x[2];",
        )
        .parameters(["ke", "kcp", "kpc", "v"])
        .observe(1, "v")
        .build()
}

/// Two-compartment model with first-order absorption
///
/// Parameters: `ka`, `ke`, `kcp`, `kpc`, `v`.
pub fn two_compartments_with_absorption() -> ModelSpec {
    ModelSpec::builder()
        .equation(
            "dx[1] = -ka * x[1];
             dx[2] = ka * x[1] - (ke + kcp) * x[2] + kpc * x[3];
             dx[3] = kcp * x[2] - kpc * x[3];",
        )
        .parameters(["ka", "ke", "kcp", "kpc", "v"])
        .observe(2, "v")
        .dose_compartment(1)
        .build()
}

/// Names of all library models
pub fn names() -> Vec<&'static str> {
    vec![
        "one_compartment",
        "one_compartment_with_absorption",
        "two_compartments",
        "two_compartments_with_absorption",
    ]
}

/// Look up a library model by name
pub fn get(name: &str) -> Option<ModelSpec> {
    match name {
        "one_compartment" => Some(one_compartment()),
        "one_compartment_with_absorption" => Some(one_compartment_with_absorption()),
        "two_compartments" => Some(two_compartments()),
        "two_compartments_with_absorption" => Some(two_compartments_with_absorption()),
        _ => None,
    }
}
