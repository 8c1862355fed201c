//! Simulation output: a flat, ordered collection of trajectory rows.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label of a trajectory row's compartment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompartmentLabel {
    /// A model compartment (zero-indexed internally, displayed 1-based)
    State(usize),
    /// The synthetic scaled-observation compartment, displayed as `"obs"`
    Observation,
}

impl fmt::Display for CompartmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompartmentLabel::State(index) => write!(f, "{}", index + 1),
            CompartmentLabel::Observation => write!(f, "obs"),
        }
    }
}

impl CompartmentLabel {
    /// Check the label against its display form (`"1"`, `"2"`, ..., `"obs"`)
    pub fn matches(&self, label: &str) -> bool {
        match self {
            CompartmentLabel::State(index) => label
                .parse::<usize>()
                .map(|parsed| parsed == index + 1)
                .unwrap_or(false),
            CompartmentLabel::Observation => label == "obs",
        }
    }
}

/// One simulated value: an individual, a time, a compartment and an amount
/// (or a scaled observation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Individual identifier, numbered from 1
    pub id: usize,
    pub time: f64,
    pub compartment: CompartmentLabel,
    pub value: f64,
}

/// The full simulation output
///
/// Rows are ordered by individual, then compartment, then time. When the model
/// defines an observation, scaled `"obs"` rows are appended per individual.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trajectory {
    rows: Vec<Row>,
}

impl Trajectory {
    pub(crate) fn from_rows(rows: Vec<Row>) -> Self {
        Trajectory { rows }
    }

    /// All rows
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the trajectory is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows belonging to one individual
    pub fn individual(&self, id: usize) -> impl Iterator<Item = &Row> {
        self.rows.iter().filter(move |row| row.id == id)
    }

    /// Rows belonging to one compartment, by display label
    pub fn compartment<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Row> {
        self.rows
            .iter()
            .filter(move |row| row.compartment.matches(label))
    }
}

impl IntoIterator for Trajectory {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;
    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;
    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_display() {
        assert_eq!(CompartmentLabel::State(0).to_string(), "1");
        assert_eq!(CompartmentLabel::State(2).to_string(), "3");
        assert_eq!(CompartmentLabel::Observation.to_string(), "obs");
    }

    #[test]
    fn test_label_matches() {
        assert!(CompartmentLabel::State(0).matches("1"));
        assert!(!CompartmentLabel::State(0).matches("2"));
        assert!(CompartmentLabel::Observation.matches("obs"));
        assert!(!CompartmentLabel::Observation.matches("1"));
    }

    #[test]
    fn test_filters() {
        let trajectory = Trajectory::from_rows(vec![
            Row {
                id: 1,
                time: 0.0,
                compartment: CompartmentLabel::State(0),
                value: 100.0,
            },
            Row {
                id: 1,
                time: 0.0,
                compartment: CompartmentLabel::Observation,
                value: 5.0,
            },
            Row {
                id: 2,
                time: 0.0,
                compartment: CompartmentLabel::State(0),
                value: 90.0,
            },
        ]);
        assert_eq!(trajectory.individual(1).count(), 2);
        assert_eq!(trajectory.compartment("1").count(), 2);
        assert_eq!(trajectory.compartment("obs").count(), 1);
    }
}
