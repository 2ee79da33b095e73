//! Model configuration.
//!
//! Every recognised option is a field of [`HdclConfig`] with a default; the
//! struct is validated once, eagerly, when the model is built.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{HdclError, Result};
use crate::hetero::{HeteroGraph, Metapath};
use crate::sampling::{NeighborSampler, ProbabilisticSampler, UniformSampler};

/// How a similarity neighbour is picked as an extra positive.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// Proportional to the similarity weight.
    #[default]
    Probabilistic,
    /// Uniform over the neighbour list.
    Uniform,
}

impl SamplingPolicy {
    pub fn sampler(&self) -> Box<dyn NeighborSampler> {
        match self {
            SamplingPolicy::Probabilistic => Box::new(ProbabilisticSampler),
            SamplingPolicy::Uniform => Box::new(UniformSampler),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HdclConfig {
    pub user_key: String,
    pub item_key: String,
    /// user -> item interaction relation (training split).
    pub ui_relation: String,

    pub embedding_dim: usize,
    pub out_size: usize,
    pub num_heads: usize,
    pub attention_hidden: usize,
    pub n_layers: usize,
    /// Perturbation magnitude of the two noisy views.
    pub epsilon: f64,
    /// Node type -> metapath patterns aggregated for that type.
    pub metapath_patterns: BTreeMap<String, Vec<Metapath>>,
    pub dropout: f64,

    pub num_clusters: usize,
    pub cluster_level: usize,
    pub kmeans_max_iter: usize,
    pub lambda_head: f64,
    pub lambda_tail: f64,
    /// Percentile of interaction counts at or above which an entity is "head".
    pub head_percentile: f64,

    pub ssl_temp: f64,
    pub simple_ssl_temp: f64,
    pub cl_rate: f64,
    /// Weight of the alignment + uniformity add-on.
    pub beta: f64,
    /// Down-weighting of the perturbed-view alignment/uniformity pair.
    pub ts: f64,
    pub emb_reg: f64,

    pub top_k: usize,
    pub shrink: f64,
    pub similarity_block_size: usize,
    pub sampling: SamplingPolicy,

    pub seed: u64,
}

impl Default for HdclConfig {
    fn default() -> Self {
        Self {
            user_key: "user".into(),
            item_key: "item".into(),
            ui_relation: "ui".into(),
            embedding_dim: 64,
            out_size: 64,
            num_heads: 1,
            attention_hidden: 128,
            n_layers: 1,
            epsilon: 0.1,
            metapath_patterns: BTreeMap::new(),
            dropout: 0.0,
            num_clusters: 32,
            cluster_level: 2,
            kmeans_max_iter: 100,
            lambda_head: 0.01,
            lambda_tail: 1.0,
            head_percentile: 80.0,
            ssl_temp: 0.1,
            simple_ssl_temp: 0.5,
            cl_rate: 0.1,
            beta: 0.1,
            ts: 0.1,
            emb_reg: 2.5e-5,
            top_k: 10,
            shrink: 0.0,
            similarity_block_size: 100,
            sampling: SamplingPolicy::Probabilistic,
            seed: 42,
        }
    }
}

fn non_negative(name: &str, v: f64) -> Result<()> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(HdclError::config("config", format!("{} must be finite and >= 0, got {}", name, v)))
    }
}

fn positive(name: &str, v: f64) -> Result<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(HdclError::config("config", format!("{} must be finite and > 0, got {}", name, v)))
    }
}

fn at_least_one(name: &str, v: usize) -> Result<()> {
    if v >= 1 {
        Ok(())
    } else {
        Err(HdclError::config("config", format!("{} must be >= 1", name)))
    }
}

impl HdclConfig {
    pub fn with_metapaths<S: Into<String>>(mut self, ntype: S, patterns: Vec<Metapath>) -> Self {
        self.metapath_patterns.insert(ntype.into(), patterns);
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self.out_size = dim / self.num_heads.max(1);
        self
    }

    pub fn with_clusters(mut self, num_clusters: usize, cluster_level: usize) -> Self {
        self.num_clusters = num_clusters;
        self.cluster_level = cluster_level;
        self
    }

    pub fn with_similarity(mut self, top_k: usize, shrink: f64) -> Self {
        self.top_k = top_k;
        self.shrink = shrink;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Scalar checks that do not need the graph.
    pub fn validate(&self) -> Result<()> {
        at_least_one("embedding_dim", self.embedding_dim)?;
        at_least_one("num_heads", self.num_heads)?;
        at_least_one("attention_hidden", self.attention_hidden)?;
        at_least_one("n_layers", self.n_layers)?;
        at_least_one("num_clusters", self.num_clusters)?;
        at_least_one("cluster_level", self.cluster_level)?;
        at_least_one("kmeans_max_iter", self.kmeans_max_iter)?;
        at_least_one("top_k", self.top_k)?;
        at_least_one("similarity_block_size", self.similarity_block_size)?;
        if self.out_size * self.num_heads != self.embedding_dim {
            return Err(HdclError::config(
                "config",
                format!(
                    "out_size * num_heads ({} * {}) must equal embedding_dim {}",
                    self.out_size, self.num_heads, self.embedding_dim
                ),
            ));
        }
        non_negative("epsilon", self.epsilon)?;
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(HdclError::config(
                "config",
                format!("dropout must be in [0, 1), got {}", self.dropout),
            ));
        }
        non_negative("lambda_head", self.lambda_head)?;
        non_negative("lambda_tail", self.lambda_tail)?;
        if !(0.0..=100.0).contains(&self.head_percentile) {
            return Err(HdclError::config(
                "config",
                format!("head_percentile must be in [0, 100], got {}", self.head_percentile),
            ));
        }
        positive("ssl_temp", self.ssl_temp)?;
        positive("simple_ssl_temp", self.simple_ssl_temp)?;
        non_negative("cl_rate", self.cl_rate)?;
        non_negative("beta", self.beta)?;
        non_negative("ts", self.ts)?;
        non_negative("emb_reg", self.emb_reg)?;
        non_negative("shrink", self.shrink)?;
        debug!("Configuration scalars validated: {:?}", self);
        Ok(())
    }

    /// Graph-dependent checks: keys, the interaction relation and every metapath.
    pub fn validate_against(&self, graph: &HeteroGraph) -> Result<()> {
        self.validate()?;
        for key in [&self.user_key, &self.item_key] {
            if graph.num_nodes(key).is_none() {
                return Err(HdclError::config("config", format!("node type '{}' not in graph", key)));
            }
        }
        let ui = graph.relation(&self.ui_relation).ok_or_else(|| {
            HdclError::config("config", format!("relation '{}' not in graph", self.ui_relation))
        })?;
        if ui.src_type != self.user_key || ui.dst_type != self.item_key {
            return Err(HdclError::config(
                "config",
                format!(
                    "relation '{}' must go {} -> {}, found {} -> {}",
                    self.ui_relation, self.user_key, self.item_key, ui.src_type, ui.dst_type
                ),
            ));
        }
        if graph.reverse_of(&self.ui_relation).is_none() {
            return Err(HdclError::config(
                "config",
                format!("relation '{}' has no reverse relation", self.ui_relation),
            ));
        }
        for key in [&self.user_key, &self.item_key] {
            let patterns = self.metapath_patterns.get(key).ok_or_else(|| {
                HdclError::config("config", format!("no metapath patterns for '{}'", key))
            })?;
            if patterns.is_empty() {
                return Err(HdclError::config(
                    "config",
                    format!("metapath pattern list for '{}' is empty", key),
                ));
            }
        }
        for (ntype, patterns) in &self.metapath_patterns {
            for mp in patterns {
                mp.validate(graph, ntype)?;
            }
        }
        Ok(())
    }
}
