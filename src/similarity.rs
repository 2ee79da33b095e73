//! # Top-K cosine similarity neighbours from the interaction matrix
//!
//! ## Algorithm Overview
//!
//! 1. **Norms**: `s_i = sqrt(sum_k R_ik^2)` along the chosen axis
//! 2. **Blocks**: entities are processed in blocks of `block_size`; each block
//!    materialises at most `block_size x n` dense similarities
//! 3. **Dot products**: for entity `i`, `w_j = <R_i, R_j>` accumulated sparsely
//!    through the transposed interaction matrix
//! 4. **Self exclusion**: `w_i = 0`
//! 5. **Shrinkage**: `w_j /= s_i · s_j + shrink + 1e-6` when normalising,
//!    otherwise `w_j /= shrink` when `shrink != 0`
//! 6. **Top-K**: partial selection of the K largest followed by a sort of just
//!    those K (descending weight, ascending id), zero weights dropped
//!
//! Lists can be shorter than K and are never padded.

use log::{debug, info, trace};
use rayon::prelude::*;
use sprs::CsMat;

use crate::error::{HdclError, Result};

const SIMILARITY_EPS: f32 = 1e-6;

/// Which side of the interaction matrix is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityAxis {
    User,
    Item,
}

/// Ordered `(neighbor, weight)` pairs of one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarityNeighborList {
    pub neighbors: Vec<u32>,
    pub weights: Vec<f32>,
}

impl SimilarityNeighborList {
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

/// Neighbour lists for every entity of one axis.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    pub axis: SimilarityAxis,
    pub lists: Vec<SimilarityNeighborList>,
}

impl SimilarityIndex {
    pub fn neighbors_of(&self, entity: usize) -> &SimilarityNeighborList {
        &self.lists[entity]
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// Parameters of the cosine k-NN computation.
#[derive(Debug, Clone)]
pub struct SimilarityParams {
    pub top_k: usize,
    pub shrink: f32,
    pub normalize: bool,
    pub block_size: usize,
}

impl Default for SimilarityParams {
    fn default() -> Self {
        Self {
            top_k: 10,
            shrink: 0.0,
            normalize: true,
            block_size: 100,
        }
    }
}

/// Computes a [`SimilarityIndex`] for `axis` of the `users x items` matrix.
pub fn compute_similarity(
    interactions: &CsMat<f32>,
    axis: SimilarityAxis,
    params: &SimilarityParams,
) -> Result<SimilarityIndex> {
    if !(params.shrink.is_finite() && params.shrink >= 0.0) {
        return Err(HdclError::config(
            "similarity",
            format!("shrink must be finite and >= 0, got {}", params.shrink),
        ));
    }
    if params.top_k == 0 || params.block_size == 0 {
        return Err(HdclError::config("similarity", "top_k and block_size must be >= 1"));
    }

    // Rows of `data` are the entities being compared, `inverted` maps each
    // feature to the entities that carry it.
    let (data, inverted): (CsMat<f32>, CsMat<f32>) = match axis {
        SimilarityAxis::User => (
            interactions.to_csr(),
            interactions.transpose_view().to_csr(),
        ),
        SimilarityAxis::Item => (
            interactions.transpose_view().to_csr(),
            interactions.to_csr(),
        ),
    };
    let n = data.rows();
    let top_k = params.top_k.min(n.max(1));

    info!("Computing {:?} similarity for {} entities, top_k={}", axis, n, top_k);
    debug!(
        "Similarity parameters: shrink={}, normalize={}, block_size={}",
        params.shrink, params.normalize, params.block_size
    );

    let norms: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| {
            data.outer_view(i)
                .map(|row| row.data().iter().map(|v| v * v).sum::<f32>().sqrt())
                .unwrap_or(0.0)
        })
        .collect();

    let mut lists: Vec<SimilarityNeighborList> = Vec::with_capacity(n);
    let mut start_block = 0;
    while start_block < n {
        let end_block = (start_block + params.block_size).min(n);
        trace!("similarity block [{}, {})", start_block, end_block);

        let block: Vec<SimilarityNeighborList> = (start_block..end_block)
            .into_par_iter()
            .map(|i| {
                let mut weights = vec![0.0f32; n];
                if let Some(row) = data.outer_view(i) {
                    for (feature, &v) in row.iter() {
                        if let Some(carriers) = inverted.outer_view(feature) {
                            for (j, &w) in carriers.iter() {
                                weights[j] += v * w;
                            }
                        }
                    }
                }
                weights[i] = 0.0;

                if params.normalize {
                    for (j, w) in weights.iter_mut().enumerate() {
                        *w /= norms[i] * norms[j] + params.shrink + SIMILARITY_EPS;
                    }
                } else if params.shrink != 0.0 {
                    for w in weights.iter_mut() {
                        *w /= params.shrink;
                    }
                }

                select_top_k(&weights, top_k)
            })
            .collect();

        lists.extend(block);
        start_block = end_block;
    }

    let empty = lists.iter().filter(|l| l.is_empty()).count();
    info!(
        "{:?} similarity done: {} entities, {} without neighbours",
        axis, n, empty
    );

    Ok(SimilarityIndex { axis, lists })
}

/// K largest weights, descending, ties broken by id, zeros dropped.
fn select_top_k(weights: &[f32], k: usize) -> SimilarityNeighborList {
    let by_weight_desc = |a: &usize, b: &usize| {
        weights[*b]
            .partial_cmp(&weights[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    };

    let mut idx: Vec<usize> = (0..weights.len()).collect();
    if idx.is_empty() {
        return SimilarityNeighborList::default();
    }
    let k = k.min(idx.len());
    if k < idx.len() {
        idx.select_nth_unstable_by(k - 1, by_weight_desc);
        idx.truncate(k);
    }
    idx.sort_unstable_by(by_weight_desc);

    let mut out = SimilarityNeighborList::default();
    for j in idx {
        let w = weights[j];
        if w != 0.0 && w.is_finite() {
            out.neighbors.push(j as u32);
            out.weights.push(w);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_top_k_orders_and_filters() {
        let w = vec![0.1, 0.0, 0.7, 0.3, 0.7];
        let out = select_top_k(&w, 3);
        assert_eq!(out.neighbors, vec![2, 4, 3]);
        assert_eq!(out.weights, vec![0.7, 0.7, 0.3]);
    }

    #[test]
    fn test_select_top_k_short_when_zeros() {
        let w = vec![0.0, 0.5, 0.0];
        let out = select_top_k(&w, 3);
        assert_eq!(out.neighbors, vec![1]);
    }
}
