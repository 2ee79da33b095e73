//! Contrastive objectives over two embedding tables.
//!
//! Both tables are indexed over the joint node space `[users; items]`, items
//! offset by `n_users`. The structured loss pairs view-1 positives with view-2
//! anchors and contrasts every positive against all view-2 batch nodes:
//!
//! ```text
//! pos_p = w_p · exp(cos(v1[src_p], v2[anc_p]) / tau)
//! ttl_p = sum_b exp(cos(v1[src_p], v2[b]) / tau)
//! loss  = -mean_p log(pos_p / ttl_p)
//! ```
//!
//! Every anchor is itself a batch node, so each term is `>= 0`.

use candle_core::{DType, Tensor, D};
use log::{debug, trace};
use rand::RngCore;

use crate::error::{HdclError, Result};
use crate::sampling::NeighborSampler;
use crate::similarity::SimilarityIndex;

const NORM_EPS: f32 = 1e-12;

/// Index triples of one batch, built without gradient tracking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositivePairs {
    /// View-1 rows of the positives.
    pub sources: Vec<u32>,
    /// View-2 rows of the anchors.
    pub anchors: Vec<u32>,
    pub weights: Vec<f32>,
    /// View-2 rows of the denominator: batch users then offset batch items.
    pub batch_nodes: Vec<u32>,
    /// Entities whose similarity list was empty.
    pub skipped_neighbors: usize,
}

impl PositivePairs {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn push(&mut self, source: u32, anchor: u32) {
        self.sources.push(source);
        self.anchors.push(anchor);
        self.weights.push(1.0);
    }
}

/// Row-wise L2 normalisation, norms clamped at `1e-12`.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.clamp(NORM_EPS, f32::MAX)?;
    Ok(x.broadcast_div(&norm)?)
}

/// Mean squared distance between normalised paired rows.
pub fn alignment(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let diff = l2_normalize(x)?.sub(&l2_normalize(y)?)?;
    Ok(diff.sqr()?.sum(D::Minus1)?.mean_all()?)
}

/// `log mean_{i<j} exp(-2 ||x_i - x_j||^2)` over normalised rows; 0 below two rows.
pub fn uniformity(x: &Tensor) -> Result<Tensor> {
    let (n, _) = x.dims2()?;
    if n < 2 {
        return Ok(Tensor::zeros((), DType::F32, x.device())?);
    }
    let x = l2_normalize(x)?;
    let sq_norms = x.sqr()?.sum_keepdim(1)?;
    let gram = x.matmul(&x.t()?)?;
    let dist = sq_norms
        .broadcast_add(&sq_norms.t()?)?
        .sub(&gram.affine(2.0, 0.0)?)?
        .relu()?;
    let mask: Vec<f32> = (0..n)
        .flat_map(|i| (0..n).map(move |j| if i < j { 1.0 } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (n, n), x.device())?;
    let pairs = (n * (n - 1) / 2) as f64;
    let mean = dist
        .affine(-2.0, 0.0)?
        .exp()?
        .mul(&mask)?
        .sum_all()?
        .affine(1.0 / pairs, 0.0)?;
    Ok(mean.log()?)
}

pub struct ContrastiveLossEngine {
    ssl_temp: f64,
    simple_temp: f64,
    sampler: Box<dyn NeighborSampler>,
    n_users: usize,
    n_items: usize,
}

impl ContrastiveLossEngine {
    pub fn new(
        ssl_temp: f64,
        simple_temp: f64,
        sampler: Box<dyn NeighborSampler>,
        n_users: usize,
        n_items: usize,
    ) -> Result<Self> {
        for (name, t) in [("ssl_temp", ssl_temp), ("simple_ssl_temp", simple_temp)] {
            if !(t.is_finite() && t > 0.0) {
                return Err(HdclError::config(
                    "contrastive",
                    format!("{} must be finite and > 0, got {}", name, t),
                ));
            }
        }
        debug!(
            "ContrastiveLossEngine: ssl_temp {}, simple temp {}, {} users, {} items",
            ssl_temp, simple_temp, n_users, n_items
        );
        Ok(Self {
            ssl_temp,
            simple_temp,
            sampler,
            n_users,
            n_items,
        })
    }

    /// Positive pairs for a batch of `(user, item)` interactions.
    ///
    /// Per user: `(u, u)`, `(item, u)` and `(sampled user neighbour, u)`.
    /// Per item: `(i, i)`, `(user, i)` and `(sampled item neighbour, i)`.
    /// Entities without similarity neighbours keep only the first two.
    pub fn build_positive_pairs(
        &self,
        users: &[u32],
        items: &[u32],
        user_sim: &SimilarityIndex,
        item_sim: &SimilarityIndex,
        rng: &mut dyn RngCore,
    ) -> Result<PositivePairs> {
        if users.len() != items.len() {
            return Err(HdclError::shape(
                "contrastive",
                format!("{} batch items", users.len()),
                items.len(),
            ));
        }
        if user_sim.len() != self.n_users || item_sim.len() != self.n_items {
            return Err(HdclError::shape(
                "contrastive",
                format!("{} user and {} item neighbour lists", self.n_users, self.n_items),
                format!("{} and {}", user_sim.len(), item_sim.len()),
            ));
        }
        if let Some(&u) = users.iter().find(|&&u| u as usize >= self.n_users) {
            return Err(HdclError::shape("contrastive", format!("user < {}", self.n_users), u));
        }
        if let Some(&i) = items.iter().find(|&&i| i as usize >= self.n_items) {
            return Err(HdclError::shape("contrastive", format!("item < {}", self.n_items), i));
        }

        let offset = self.n_users as u32;
        let mut pairs = PositivePairs::default();
        pairs.batch_nodes.extend_from_slice(users);
        pairs.batch_nodes.extend(items.iter().map(|&i| i + offset));

        for (&u, &i) in users.iter().zip(items) {
            pairs.push(u, u);
            pairs.push(i + offset, u);
            let list = user_sim.neighbors_of(u as usize);
            match self.sampler.sample(&list.neighbors, &list.weights, rng) {
                Some((neighbor, _)) => pairs.push(neighbor, u),
                None => pairs.skipped_neighbors += 1,
            }
        }
        for (&u, &i) in users.iter().zip(items) {
            let node = i + offset;
            pairs.push(node, node);
            pairs.push(u, node);
            let list = item_sim.neighbors_of(i as usize);
            match self.sampler.sample(&list.neighbors, &list.weights, rng) {
                Some((neighbor, _)) => pairs.push(neighbor + offset, node),
                None => pairs.skipped_neighbors += 1,
            }
        }

        if pairs.skipped_neighbors > 0 {
            trace!(
                "{} batch entities without similarity neighbours",
                pairs.skipped_neighbors
            );
        }
        Ok(pairs)
    }

    /// Structured cross-view loss; `view1`/`view2` are `(n_users + n_items, D)`.
    pub fn structured_loss(&self, view1: &Tensor, view2: &Tensor, pairs: &PositivePairs) -> Result<Tensor> {
        if pairs.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, view1.device())?);
        }
        let device = view1.device();
        let ids = |v: &[u32]| Tensor::from_vec(v.to_vec(), v.len(), device);

        let src = l2_normalize(&view1.index_select(&ids(&pairs.sources)?, 0)?)?;
        let anc = l2_normalize(&view2.index_select(&ids(&pairs.anchors)?, 0)?)?;
        let batch = l2_normalize(&view2.index_select(&ids(&pairs.batch_nodes)?, 0)?)?;
        let weights = Tensor::from_vec(pairs.weights.clone(), pairs.weights.len(), device)?;

        let inv_t = 1.0 / self.ssl_temp;
        let pos_logits = src.mul(&anc)?.sum(1)?.affine(inv_t, 0.0)?.add(&weights.log()?)?;
        let ttl_logits = src.matmul(&batch.t()?)?.affine(inv_t, 0.0)?.log_sum_exp(1)?;
        Ok(ttl_logits.sub(&pos_logits)?.mean_all()?)
    }

    /// InfoNCE between the same (deduplicated) rows of two views.
    pub fn info_nce(&self, view1: &Tensor, view2: &Tensor, index: &[u32]) -> Result<Tensor> {
        let mut unique = index.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, view1.device())?);
        }
        let idx = Tensor::from_vec(unique.clone(), unique.len(), view1.device())?;
        let e1 = l2_normalize(&view1.index_select(&idx, 0)?)?;
        let e2 = l2_normalize(&view2.index_select(&idx, 0)?)?;
        let inv_t = 1.0 / self.simple_temp;
        let pos = e1.mul(&e2)?.sum(1)?.affine(inv_t, 0.0)?;
        let all = e1.matmul(&e2.t()?)?.affine(inv_t, 0.0)?.log_sum_exp(1)?;
        Ok(all.sub(&pos)?.mean_all()?)
    }

    /// `(alignment(x, y), (uniformity(x) + uniformity(y)) / 2)`.
    pub fn alignment_uniformity(&self, x: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        let align = alignment(x, y)?;
        let uniform = uniformity(x)?.add(&uniformity(y)?)?.affine(0.5, 0.0)?;
        Ok((align, uniform))
    }
}
