// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cached singular value decomposition of an operator weight.
//!
//! The decomposition is computed once, in `f64`, and shared between every
//! rank-truncated pseudo-inverse built from it.

use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, DVector};

use crate::error::{LreError, Result};

/// Relative floor below which singular values are treated as zero.
pub const DEFAULT_RCOND: f64 = 1e-6;

/// `W = U · diag(σ) · Vᵀ` with `σ` in descending order.
#[derive(Debug, Clone)]
pub struct SvdFactors {
    /// Left singular vectors as columns, `[d_out, k]`.
    u: DMatrix<f64>,
    /// Singular values, descending, length `k = min(d_out, d_in)`.
    singular_values: DVector<f64>,
    /// Right singular vectors as rows, `[k, d_in]`.
    v_t: DMatrix<f64>,
}

impl SvdFactors {
    /// Decompose a `[d_out, d_in]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Linalg`] if the tensor is not a matrix, holds
    /// non-finite values, or the decomposition fails.
    pub fn from_tensor(weight: &Tensor) -> Result<Self> {
        let matrix = tensor_to_matrix(weight)?;
        Self::from_matrix(matrix)
    }

    /// Decompose a matrix.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Linalg`] if the matrix holds non-finite values
    /// or the decomposition fails.
    pub fn from_matrix(matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(LreError::Linalg("matrix has non-finite entries".into()));
        }
        let svd = matrix.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(LreError::Linalg("SVD did not produce singular vectors".into()));
        };
        let values = svd.singular_values;

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

        let u = DMatrix::from_fn(u.nrows(), order.len(), |r, c| u[(r, order[c])]);
        let v_t = DMatrix::from_fn(order.len(), v_t.ncols(), |r, c| v_t[(order[r], c)]);
        let singular_values = DVector::from_iterator(order.len(), order.iter().map(|&i| values[i]));

        Ok(Self {
            u,
            singular_values,
            v_t,
        })
    }

    /// Singular values, descending.
    #[must_use]
    pub fn singular_values(&self) -> &[f64] {
        self.singular_values.as_slice()
    }

    /// `min(d_out, d_in)`.
    #[must_use]
    pub fn max_rank(&self) -> usize {
        self.singular_values.len()
    }

    /// Number of singular values kept at `rank` after the relative floor
    /// `rcond · σ_max`.
    #[must_use]
    pub fn effective_rank(&self, rank: usize, rcond: f64) -> usize {
        let floor = self.floor(rcond);
        self.singular_values
            .iter()
            .take(rank)
            .filter(|&&s| s > floor)
            .count()
    }

    fn floor(&self, rcond: f64) -> f64 {
        self.singular_values.iter().copied().fold(0.0, f64::max) * rcond
    }

    /// Rank-truncated pseudo-inverse `V_r · Σ_r⁻¹ · U_rᵀ`, `[d_in, d_out]`.
    ///
    /// Directions beyond `rank`, and those whose singular value is at or
    /// below `rcond · σ_max`, contribute nothing.
    #[must_use]
    pub fn pinv(&self, rank: usize, rcond: f64) -> DMatrix<f64> {
        let floor = self.floor(rcond);
        let d_in = self.v_t.ncols();
        let d_out = self.u.nrows();
        let mut pinv = DMatrix::zeros(d_in, d_out);
        for (i, &sigma) in self.singular_values.iter().enumerate().take(rank) {
            if sigma <= floor {
                continue;
            }
            let v = self.v_t.row(i).transpose();
            let u = self.u.column(i);
            pinv += (v * u.transpose()) / sigma;
        }
        pinv
    }

    /// Rank-`rank` reconstruction `U_r · Σ_r · V_rᵀ`.
    #[must_use]
    pub fn reconstruct(&self, rank: usize) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.u.nrows(), self.v_t.ncols());
        for (i, &sigma) in self.singular_values.iter().enumerate().take(rank) {
            out += (self.u.column(i) * self.v_t.row(i)) * sigma;
        }
        out
    }
}

/// Copy a rank-2 tensor into an `f64` matrix.
///
/// # Errors
///
/// Returns [`LreError::Linalg`] if the tensor is not rank 2.
pub fn tensor_to_matrix(tensor: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = tensor
        .dims2()
        .map_err(|e| LreError::Linalg(format!("expected a matrix: {e}")))?;
    let data: Vec<Vec<f64>> = tensor.to_dtype(DType::F64)?.to_vec2()?;
    Ok(DMatrix::from_fn(rows, cols, |r, c| {
        data.get(r).and_then(|row| row.get(c)).copied().unwrap_or(0.0)
    }))
}

/// Copy an `f64` matrix into an `f32` tensor on `device`.
///
/// # Errors
///
/// Propagates tensor construction errors.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn matrix_to_tensor(matrix: &DMatrix<f64>, device: &Device) -> Result<Tensor> {
    let (rows, cols) = matrix.shape();
    let data: Vec<f32> = (0..rows)
        .flat_map(|r| (0..cols).map(move |c| matrix[(r, c)] as f32))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}
