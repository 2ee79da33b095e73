//! Metapath-based aggregation with semantic attention.
//!
//! For each metapath pattern of a node type the encoder derives the
//! metapath-reachable homogeneous graph, smooths the node features over it with
//! a degree-normalised graph convolution (no learnable weight), and fuses the
//! per-metapath results with a learned attention over metapaths:
//!
//! ```text
//! z_m   = D_in^-1/2 · A_m^T · D_out^-1/2 · H          (N, D) per metapath m
//! w_m   = mean_n( q^T tanh(W z_{n,m} + b) )
//! beta  = softmax_m(w)
//! out_n = sum_m beta_m z_{n,m}
//! ```
//!
//! Reachable graphs are cached inside the encoder against the graph token and
//! rebuilt only when a different graph is passed or the cache is invalidated.

use std::collections::BTreeMap;

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{ops, Linear};
use log::{debug, info, trace};
use rand::{Rng, RngCore};

use crate::adjacency::SparseOperator;
use crate::error::{HdclError, Result};
use crate::hetero::{GraphToken, HeteroGraph, Metapath};
use crate::params::{Init, ParamStore};

/// `Linear -> tanh -> Linear(no bias)` scoring head over metapath embeddings.
pub struct SemanticAttention {
    hidden: Linear,
    score: Linear,
}

impl SemanticAttention {
    pub fn new(params: &mut ParamStore, prefix: &str, in_size: usize, hidden: usize) -> Result<Self> {
        let w1 = params.matrix(&format!("{}.project.0.weight", prefix), hidden, in_size, Init::XavierUniform)?;
        let b1 = params.vector(&format!("{}.project.0.bias", prefix), hidden)?;
        let w2 = params.matrix(&format!("{}.project.2.weight", prefix), 1, hidden, Init::XavierUniform)?;
        Ok(Self {
            hidden: Linear::new(w1.as_tensor().clone(), Some(b1.as_tensor().clone())),
            score: Linear::new(w2.as_tensor().clone(), None),
        })
    }

    /// Softmax weights over metapaths for `z` of shape `(N, M, D)`, shape `(M, 1)`.
    pub fn weights(&self, z: &Tensor) -> Result<Tensor> {
        let projected = self.hidden.forward(z)?.tanh()?;
        let w = self.score.forward(&projected)?.mean(0)?;
        Ok(ops::softmax(&w, 0)?)
    }

    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let beta = self.weights(z)?.unsqueeze(0)?;
        Ok(z.broadcast_mul(&beta)?.sum(1)?)
    }
}

/// Reachable-graph operators keyed by metapath, valid for one graph token.
#[derive(Default)]
pub struct MetapathCache {
    token: Option<GraphToken>,
    operators: BTreeMap<Metapath, SparseOperator>,
    builds: usize,
}

impl MetapathCache {
    pub fn is_valid_for(&self, graph: &HeteroGraph) -> bool {
        self.token == Some(graph.token())
    }

    pub fn invalidate(&mut self) {
        self.token = None;
        self.operators.clear();
    }

    /// Number of times the operators were (re)materialised.
    pub fn builds(&self) -> usize {
        self.builds
    }

    fn ensure(
        &mut self,
        graph: &HeteroGraph,
        patterns: &[Metapath],
        device: &Device,
    ) -> Result<&BTreeMap<Metapath, SparseOperator>> {
        if !self.is_valid_for(graph) {
            self.operators.clear();
            for mp in patterns {
                let reachable = mp.reachable(graph)?;
                self.operators.insert(mp.clone(), graph_conv_operator(&reachable, device)?);
            }
            self.token = Some(graph.token());
            self.builds += 1;
            info!("Materialised {} metapath graphs (build #{})", patterns.len(), self.builds);
        }
        Ok(&self.operators)
    }
}

/// Symmetric-degree normalised message passing `src -> dst`; degrees clamp at 1.
fn graph_conv_operator(reachable: &sprs::CsMat<f32>, device: &Device) -> Result<SparseOperator> {
    let (n_src, n_dst) = (reachable.rows(), reachable.cols());
    let mut out_deg = vec![0usize; n_src];
    let mut in_deg = vec![0usize; n_dst];
    for (_, (s, d)) in reachable.iter() {
        out_deg[s] += 1;
        in_deg[d] += 1;
    }
    let nnz = reachable.nnz();
    let mut rows = Vec::with_capacity(nnz);
    let mut cols = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    for (_, (s, d)) in reachable.iter() {
        rows.push(d as u32);
        cols.push(s as u32);
        let norm = (out_deg[s].max(1) as f32).powf(-0.5) * (in_deg[d].max(1) as f32).powf(-0.5);
        values.push(norm);
    }
    SparseOperator::from_coo(rows, cols, values, (n_dst, n_src), device)
}

/// Inverted dropout with a mask drawn from `rng`.
pub(crate) fn dropout(x: &Tensor, p: f64, rng: &mut dyn RngCore) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let scale = 1.0 / (1.0 - p) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.random::<f64>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.shape(), x.device())?;
    Ok(x.mul(&mask)?)
}

pub struct MetapathEncoder {
    ntype: String,
    patterns: Vec<Metapath>,
    attention: SemanticAttention,
    cache: MetapathCache,
    dropout: f64,
}

impl MetapathEncoder {
    pub fn new(
        ntype: impl Into<String>,
        patterns: Vec<Metapath>,
        attention: SemanticAttention,
        dropout: f64,
    ) -> Self {
        let ntype = ntype.into();
        debug!("MetapathEncoder for '{}' with patterns {:?}", ntype, patterns);
        Self {
            ntype,
            patterns,
            attention,
            cache: MetapathCache::default(),
            dropout,
        }
    }

    pub fn ntype(&self) -> &str {
        &self.ntype
    }

    pub fn patterns(&self) -> &[Metapath] {
        &self.patterns
    }

    pub fn cache(&self) -> &MetapathCache {
        &self.cache
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    /// Per-metapath smoothed features stacked as `(N, M, D)`.
    pub fn metapath_embeddings(&mut self, graph: &HeteroGraph, features: &Tensor) -> Result<Tensor> {
        let expected = graph.num_nodes(&self.ntype).ok_or_else(|| {
            HdclError::config("metapath", format!("node type '{}' not in graph", self.ntype))
        })?;
        let (rows, _) = features.dims2()?;
        if rows != expected {
            return Err(HdclError::shape("metapath", expected, rows));
        }
        let operators = self.cache.ensure(graph, &self.patterns, features.device())?;
        let per_path = self
            .patterns
            .iter()
            .map(|mp| match operators.get(mp) {
                Some(op) => op.matmul(features),
                None => Err(HdclError::config("metapath", format!("no operator for {:?}", mp))),
            })
            .collect::<Result<Vec<_>>>()?;
        trace!("'{}': {} metapath embeddings", self.ntype, per_path.len());
        Ok(Tensor::stack(&per_path, 1)?)
    }

    /// Softmax weights over this encoder's metapaths.
    pub fn attention_weights(&mut self, graph: &HeteroGraph, features: &Tensor) -> Result<Vec<f32>> {
        let z = self.metapath_embeddings(graph, features)?;
        Ok(self.attention.weights(&z)?.squeeze(D::Minus1)?.to_vec1::<f32>()?)
    }

    pub fn forward(
        &mut self,
        graph: &HeteroGraph,
        features: &Tensor,
        train: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        let mut z = self.metapath_embeddings(graph, features)?;
        if train {
            z = dropout(&z, self.dropout, rng)?;
        }
        self.attention.forward(&z)
    }
}
