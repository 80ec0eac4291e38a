//! Contiguous dataset helpers.
//!
//! Feature matrices are stored row-major so that mini-batches can be gathered
//! into a single buffer and fed to the GEMM kernels. Labels are class indices.

use crate::{Error, Result};

/// A feature matrix (X) with shape `(len, dim)`.
///
/// Stored as a contiguous buffer with row-major layout:
/// - `values.len() == len * dim`
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    values: Vec<f32>,
    len: usize,
    dim: usize,
}

impl Features {
    /// Build features from a flat buffer with shape `(len, dim)`.
    pub fn from_flat(values: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidData("feature dim must be > 0".to_owned()));
        }
        if !values.len().is_multiple_of(dim) {
            return Err(Error::InvalidData(format!(
                "features length {} is not divisible by dim {}",
                values.len(),
                dim
            )));
        }

        let len = values.len() / dim;
        Ok(Self { values, len, dim })
    }

    /// Build features from per-sample rows.
    ///
    /// This is a convenience constructor (it copies into contiguous storage).
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = match rows.first() {
            Some(row) => row.len(),
            None => return Err(Error::InvalidData("features must not be empty".to_owned())),
        };
        if dim == 0 {
            return Err(Error::InvalidData("feature dim must be > 0".to_owned()));
        }

        let mut values = Vec::with_capacity(rows.len() * dim);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(Error::InvalidData(format!(
                    "feature row {i} has len {}, expected {dim}",
                    row.len()
                )));
            }
            values.extend_from_slice(row);
        }

        Ok(Self {
            values,
            len: rows.len(),
            dim,
        })
    }

    #[inline]
    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    /// Returns the per-sample feature dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    /// Returns the `idx`-th row.
    ///
    /// Panics if `idx >= len`.
    pub fn row(&self, idx: usize) -> &[f32] {
        let start = idx * self.dim;
        &self.values[start..start + self.dim]
    }

    /// Contiguous rows `start..end` as one flat slice.
    #[inline]
    pub fn rows(&self, start: usize, end: usize) -> &[f32] {
        &self.values[start * self.dim..end * self.dim]
    }

    #[inline]
    pub fn as_flat(&self) -> &[f32] {
        &self.values
    }

    /// Copy the rows at `indices` (in that order) into a new matrix.
    ///
    /// Panics if any index is out of bounds.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut values = Vec::with_capacity(indices.len() * self.dim);
        for &idx in indices {
            values.extend_from_slice(self.row(idx));
        }
        Self {
            values,
            len: indices.len(),
            dim: self.dim,
        }
    }
}

/// A labelled dataset: features (X) and class indices (y).
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Features,
    labels: Vec<usize>,
}

impl Dataset {
    pub fn new(features: Features, labels: Vec<usize>) -> Result<Self> {
        if features.len() != labels.len() {
            return Err(Error::InvalidData(format!(
                "features/labels length mismatch: {} vs {}",
                features.len(),
                labels.len()
            )));
        }
        Ok(Self { features, labels })
    }

    /// Build a dataset from a flat `(len, dim)` feature buffer.
    pub fn from_flat(values: Vec<f32>, dim: usize, labels: Vec<usize>) -> Result<Self> {
        Self::new(Features::from_flat(values, dim)?, labels)
    }

    /// Build a dataset from per-sample rows.
    pub fn from_rows(rows: &[Vec<f32>], labels: &[usize]) -> Result<Self> {
        if rows.len() != labels.len() {
            return Err(Error::InvalidData(format!(
                "features/labels length mismatch: {} vs {}",
                rows.len(),
                labels.len()
            )));
        }
        Self::new(Features::from_rows(rows)?, labels.to_vec())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.features.dim()
    }

    #[inline]
    pub fn features(&self) -> &Features {
        &self.features
    }

    #[inline]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Copy the samples at `indices` (in that order) into a new dataset.
    ///
    /// Panics if any index is out of bounds.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.subset(indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Ensure every label is a valid class index for `nclasses` classes.
    pub fn check_labels(&self, nclasses: usize) -> Result<()> {
        if let Some((i, &label)) = self
            .labels
            .iter()
            .enumerate()
            .find(|&(_, &label)| label >= nclasses)
        {
            return Err(Error::InvalidData(format!(
                "label {label} at row {i} is out of range for {nclasses} classes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_from_flat_validates_shapes() {
        assert!(Features::from_flat(vec![0.0, 1.0, 2.0, 3.0], 2).is_ok());
        assert!(Features::from_flat(vec![0.0, 1.0, 2.0], 2).is_err());
        assert!(Features::from_flat(vec![], 0).is_err());
    }

    #[test]
    fn dataset_rejects_label_count_mismatch() {
        let err = Dataset::from_flat(vec![0.0, 1.0, 2.0, 3.0], 2, vec![0]);
        assert!(err.is_err());
    }

    #[test]
    fn subset_keeps_requested_order() {
        let data = Dataset::from_rows(
            &[vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]],
            &[0, 1, 2],
        )
        .unwrap();
        let sub = data.subset(&[2, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.features().row(0), &[2.0, 2.0]);
        assert_eq!(sub.labels(), &[2, 0]);
    }

    #[test]
    fn check_labels_flags_out_of_range() {
        let data = Dataset::from_rows(&[vec![0.0], vec![1.0]], &[0, 3]).unwrap();
        assert!(data.check_labels(4).is_ok());
        assert!(data.check_labels(3).is_err());
    }
}
