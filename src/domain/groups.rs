//! Measurement groups.
//!
//! Each measurement belongs to exactly one group; the fit determines one
//! combined value per group. The design matrix `G` has one row per
//! measurement and one column per distinct label (sorted), with a single 1
//! per row.

use std::collections::BTreeSet;

use nalgebra::DMatrix;

use crate::domain::types::Measurement;

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMatrix {
    labels: Vec<String>,
    assignment: Vec<usize>,
    matrix: DMatrix<f64>,
}

impl GroupMatrix {
    pub fn from_measurements(measurements: &[Measurement]) -> Self {
        let labels: Vec<&str> = measurements.iter().map(|m| m.group.as_str()).collect();
        Self::from_labels(&labels)
    }

    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let distinct: BTreeSet<&str> = labels.iter().map(|l| l.as_ref()).collect();
        let columns: Vec<String> = distinct.into_iter().map(str::to_string).collect();

        let assignment: Vec<usize> = labels
            .iter()
            .map(|l| {
                columns
                    .binary_search_by(|c| c.as_str().cmp(l.as_ref()))
                    .unwrap_or_default()
            })
            .collect();

        let mut matrix = DMatrix::zeros(labels.len(), columns.len());
        for (row, &col) in assignment.iter().enumerate() {
            matrix[(row, col)] = 1.0;
        }

        Self {
            labels: columns,
            assignment,
            matrix,
        }
    }

    /// Sorted group labels, one per column.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_groups(&self) -> usize {
        self.labels.len()
    }

    pub fn n_measurements(&self) -> usize {
        self.assignment.len()
    }

    /// Column index of measurement `i`.
    pub fn group_of(&self, i: usize) -> usize {
        self.assignment[i]
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}
