//! # Symmetric normalised user-item propagation operator
//!
//! ## Algorithm Overview
//!
//! 1. **Bipartite layout**: users occupy `[0, n_users)`, items are offset to
//!    `[n_users, n_users + n_items)`
//! 2. **Symmetrisation**: `A = R + R^T` over the joint index space
//! 3. **Degrees**: `d_i = sum_j A_ij`, with `d_i^-1/2` clamped to 0 for isolated nodes
//! 4. **Normalisation**: `G = D^-1/2 · A · D^-1/2` via two sparse products against
//!    the diagonal degree matrix
//!
//! The resulting [`NormalizedAdjacency`] is built once and shared read-only by
//! every forward pass. [`SparseOperator`] is its device-side form: a COO list
//! applied to dense tensors with `index_select` + `index_add`, which keeps the
//! operation differentiable with respect to the dense operand.

use candle_core::{DType, Device, Tensor};
use log::{debug, info, trace, warn};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};

use crate::error::{HdclError, Result};

/// `D^-1/2 A D^-1/2` over the concatenated user/item index space.
#[derive(Debug, Clone)]
pub struct NormalizedAdjacency {
    pub matrix: CsMat<f32>,
    pub n_users: usize,
    pub n_items: usize,
    /// Raw degrees of the symmetrised adjacency.
    pub degrees: Vec<f32>,
}

impl NormalizedAdjacency {
    pub fn n_nodes(&self) -> usize {
        self.n_users + self.n_items
    }

    pub fn weight(&self, i: usize, j: usize) -> f32 {
        self.matrix.get(i, j).copied().unwrap_or(0.0)
    }

    /// Nodes without any interaction.
    pub fn isolated_nodes(&self) -> Vec<usize> {
        self.degrees
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn to_operator(&self, device: &Device) -> Result<SparseOperator> {
        SparseOperator::from_csr(&self.matrix, device)
    }
}

/// Builds a [`NormalizedAdjacency`] from `(user, item)` interaction pairs.
pub struct SparseAdjacencyBuilder {
    n_users: usize,
    n_items: usize,
}

impl SparseAdjacencyBuilder {
    pub fn new(n_users: usize, n_items: usize) -> Self {
        Self { n_users, n_items }
    }

    /// Interaction matrix `R` (`n_users x n_items`); duplicates are summed.
    pub fn interaction_matrix(&self, pairs: &[(u32, u32)]) -> Result<CsMat<f32>> {
        let mut tri = TriMat::with_capacity((self.n_users, self.n_items), pairs.len());
        for &(u, i) in pairs {
            if u as usize >= self.n_users || i as usize >= self.n_items {
                return Err(HdclError::shape(
                    "adjacency",
                    format!("user < {} and item < {}", self.n_users, self.n_items),
                    format!("interaction ({}, {})", u, i),
                ));
            }
            tri.add_triplet(u as usize, i as usize, 1.0f32);
        }
        Ok(tri.to_csr())
    }

    pub fn build(&self, pairs: &[(u32, u32)]) -> Result<NormalizedAdjacency> {
        let r = self.interaction_matrix(pairs)?;
        self.build_from_interactions(&r)
    }

    pub fn build_from_interactions(&self, r: &CsMat<f32>) -> Result<NormalizedAdjacency> {
        if r.rows() != self.n_users || r.cols() != self.n_items {
            return Err(HdclError::shape(
                "adjacency",
                format!("{}x{}", self.n_users, self.n_items),
                format!("{}x{}", r.rows(), r.cols()),
            ));
        }
        let n = self.n_users + self.n_items;
        info!(
            "Building normalised adjacency: {} users, {} items, {} interactions",
            self.n_users,
            self.n_items,
            r.nnz()
        );

        let mut tri = TriMat::with_capacity((n, n), 2 * r.nnz());
        for (&v, (u, i)) in r.iter() {
            if !v.is_finite() {
                return Err(HdclError::DegenerateInput {
                    component: "adjacency",
                    message: format!("non-finite interaction weight at ({}, {})", u, i),
                });
            }
            let col = self.n_users + i;
            tri.add_triplet(u, col, v);
            tri.add_triplet(col, u, v);
        }
        let adj: CsMat<f32> = tri.to_csr();

        let degrees: Vec<f32> = adj
            .outer_iterator()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|row| row.data().iter().sum::<f32>())
            .collect();

        let isolated = degrees.iter().filter(|&&d| d == 0.0).count();
        if isolated > 0 {
            warn!(
                "{} nodes have zero degree; their normalisation factor is clamped to 0",
                isolated
            );
        }

        let d_inv_sqrt: Vec<f32> = degrees
            .iter()
            .map(|&d| {
                let v = d.powf(-0.5);
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            })
            .collect();

        let mut diag = TriMat::with_capacity((n, n), n);
        for (i, &v) in d_inv_sqrt.iter().enumerate() {
            if v != 0.0 {
                diag.add_triplet(i, i, v);
            }
        }
        let diag: CsMat<f32> = diag.to_csr();

        let left = &diag * &adj;
        let matrix = &left * &diag;
        trace!("normalised adjacency nnz {}", matrix.nnz());

        debug!(
            "Normalised adjacency {}x{} with {} non-zeros",
            matrix.rows(),
            matrix.cols(),
            matrix.nnz()
        );

        Ok(NormalizedAdjacency {
            matrix,
            n_users: self.n_users,
            n_items: self.n_items,
            degrees,
        })
    }
}

/// Device-side COO sparse matrix applied to dense `(n_cols, d)` tensors.
#[derive(Debug, Clone)]
pub struct SparseOperator {
    rows: Tensor,
    cols: Tensor,
    values: Tensor,
    shape: (usize, usize),
    nnz: usize,
}

impl SparseOperator {
    pub fn from_csr(matrix: &CsMat<f32>, device: &Device) -> Result<Self> {
        let nnz = matrix.nnz();
        let mut rows = Vec::with_capacity(nnz);
        let mut cols = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        for (&v, (r, c)) in matrix.iter() {
            rows.push(r as u32);
            cols.push(c as u32);
            values.push(v);
        }
        Self::from_coo(rows, cols, values, (matrix.rows(), matrix.cols()), device)
    }

    pub fn from_coo(
        rows: Vec<u32>,
        cols: Vec<u32>,
        values: Vec<f32>,
        shape: (usize, usize),
        device: &Device,
    ) -> Result<Self> {
        let nnz = values.len();
        if rows.len() != nnz || cols.len() != nnz {
            return Err(HdclError::shape(
                "adjacency",
                format!("{} row/col indices", nnz),
                format!("{} rows, {} cols", rows.len(), cols.len()),
            ));
        }
        Ok(Self {
            rows: Tensor::from_vec(rows, nnz, device)?,
            cols: Tensor::from_vec(cols, nnz, device)?,
            values: Tensor::from_vec(values, (nnz, 1), device)?,
            shape,
            nnz,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// `self · x` for dense `x` of shape `(n_cols, d)`.
    pub fn matmul(&self, x: &Tensor) -> Result<Tensor> {
        let (n, d) = x.dims2()?;
        if n != self.shape.1 {
            return Err(HdclError::shape(
                "adjacency",
                format!("{} rows in operand", self.shape.1),
                n,
            ));
        }
        let out = Tensor::zeros((self.shape.0, d), x.dtype(), x.device())?;
        if self.nnz == 0 {
            return Ok(out);
        }
        let values = if x.dtype() == DType::F32 {
            self.values.clone()
        } else {
            self.values.to_dtype(x.dtype())?
        };
        let messages = x.index_select(&self.cols, 0)?.broadcast_mul(&values)?;
        Ok(out.index_add(&self.rows, &messages, 0)?)
    }
}
