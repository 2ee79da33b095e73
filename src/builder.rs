use std::collections::BTreeMap;

use candle_core::Device;
use log::{debug, info, trace, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sprs::CsMat;

use crate::adjacency::SparseAdjacencyBuilder;
use crate::clustering::{AnchorSettings, ClusterAnchorRegularizer, Frozen};
use crate::config::{HdclConfig, SamplingPolicy};
use crate::contrastive::ContrastiveLossEngine;
use crate::error::{HdclError, Result};
use crate::hetero::{HeteroGraph, Metapath};
use crate::metapath::{MetapathEncoder, SemanticAttention};
use crate::model::HdclModel;
use crate::params::{Init, ParamStore};
use crate::propagation::PropagationEncoder;
use crate::similarity::{compute_similarity, SimilarityAxis, SimilarityParams};

pub struct HdclBuilder {
    config: HdclConfig,
    device: Device,
}

impl Default for HdclBuilder {
    fn default() -> Self {
        debug!("Creating HdclBuilder with default configuration");
        Self {
            config: HdclConfig::default(),
            device: Device::Cpu,
        }
    }
}

impl HdclBuilder {
    pub fn new() -> Self {
        info!("Initializing new HdclBuilder");
        Self::default()
    }

    // -------------------- Configuration --------------------

    pub fn with_config(mut self, config: HdclConfig) -> Self {
        debug!("Using provided configuration");
        self.config = config;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        info!("Setting device: {:?}", device);
        self.device = device;
        self
    }

    /// Metapath patterns aggregated for node type `ntype`.
    pub fn with_metapaths<S: Into<String>>(mut self, ntype: S, patterns: Vec<Metapath>) -> Self {
        let ntype = ntype.into();
        info!("Configuring {} metapaths for '{}'", patterns.len(), ntype);
        self.config.metapath_patterns.insert(ntype, patterns);
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        info!("Setting embedding dimension: {}", dim);
        self.config = self.config.with_embedding_dim(dim);
        self
    }

    /// Cluster count at level 0 and hierarchy depth.
    pub fn with_clusters(mut self, num_clusters: usize, cluster_level: usize) -> Self {
        info!("Configuring clusters: k={}, levels={}", num_clusters, cluster_level);
        self.config = self.config.with_clusters(num_clusters, cluster_level);
        self
    }

    pub fn with_similarity(mut self, top_k: usize, shrink: f64) -> Self {
        info!("Configuring similarity: top_k={}, shrink={}", top_k, shrink);
        self.config = self.config.with_similarity(top_k, shrink);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingPolicy) -> Self {
        info!("Setting neighbour sampling: {:?}", sampling);
        self.config.sampling = sampling;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config = self.config.with_seed(seed);
        self
    }

    // -------------------- Build --------------------

    /// Validates the configuration against `graph` and assembles the model.
    ///
    /// Order: adjacency, learnable tables, propagation encoder, metapath
    /// encoders, similarity indices, cluster anchors (from a frozen snapshot of
    /// the initial node features), contrastive engine.
    pub fn build(self, graph: HeteroGraph) -> Result<HdclModel> {
        let config = self.config;
        config.validate_against(&graph)?;
        debug!("Build configuration: {:?}", config);

        let n_users = node_count(&graph, &config.user_key)?;
        let n_items = node_count(&graph, &config.item_key)?;
        info!("Building HDCL model: {} users, {} items", n_users, n_items);

        // 1) Interactions and normalised adjacency
        let interactions: CsMat<f32> = graph.relation_matrix(&config.ui_relation)?.map(|_| 1.0f32);
        let adjacency = SparseAdjacencyBuilder::new(n_users, n_items).build_from_interactions(&interactions)?;

        // 2) Learnable tables
        let mut params = ParamStore::new(&self.device, config.seed);
        let mut features = BTreeMap::new();
        let node_types: Vec<(String, usize)> =
            graph.node_types().map(|(t, n)| (t.to_string(), n)).collect();
        for (ntype, n) in node_types {
            let var = params.matrix(&format!("features.{}", ntype), n, config.embedding_dim, Init::XavierUniform)?;
            trace!("features '{}': {} x {}", ntype, n, config.embedding_dim);
            features.insert(ntype, var);
        }
        let base = params.matrix(
            "propagation.base",
            n_users + n_items,
            config.embedding_dim,
            Init::XavierNormal,
        )?;

        // 3) Encoders
        let propagation = PropagationEncoder::new(&adjacency, base, config.n_layers, config.epsilon)?;
        let semantic_in = config.out_size * config.num_heads;
        let encoder_for = |key: &str, params: &mut ParamStore| -> Result<MetapathEncoder> {
            let patterns = config
                .metapath_patterns
                .get(key)
                .cloned()
                .ok_or_else(|| HdclError::config("config", format!("no metapath patterns for '{}'", key)))?;
            let attention = SemanticAttention::new(params, &format!("metapath.{}", key), semantic_in, config.attention_hidden)?;
            Ok(MetapathEncoder::new(key, patterns, attention, config.dropout))
        };
        let user_metapath = encoder_for(&config.user_key, &mut params)?;
        let item_metapath = encoder_for(&config.item_key, &mut params)?;
        for ntype in config.metapath_patterns.keys() {
            if *ntype != config.user_key && *ntype != config.item_key {
                warn!("Metapath patterns for '{}' are validated but not aggregated", ntype);
            }
        }

        // 4) Similarity neighbours
        let sim_params = SimilarityParams {
            top_k: config.top_k,
            shrink: config.shrink as f32,
            normalize: true,
            block_size: config.similarity_block_size,
        };
        let user_similarity = compute_similarity(&interactions, SimilarityAxis::User, &sim_params)?;
        let item_similarity = compute_similarity(&interactions, SimilarityAxis::Item, &sim_params)?;

        // 5) Cluster anchors from the initial features
        let user_counts = row_sums(&interactions);
        let item_counts = row_sums(&interactions.transpose_view().to_csr());
        let snapshot = |key: &str| -> Result<Frozen> {
            features
                .get(key)
                .map(|v| Frozen::of(v.as_tensor()))
                .ok_or_else(|| HdclError::config("cluster-init", format!("no features for '{}'", key)))
        };
        let settings = AnchorSettings {
            dim: config.embedding_dim,
            num_clusters: config.num_clusters,
            depth: config.cluster_level,
            max_iter: config.kmeans_max_iter,
            head_percentile: config.head_percentile,
            lambda_head: config.lambda_head,
            lambda_tail: config.lambda_tail,
            seed: config.seed,
        };
        let regularizer = ClusterAnchorRegularizer::new(
            &snapshot(&config.user_key)?,
            &snapshot(&config.item_key)?,
            &user_counts,
            &item_counts,
            &settings,
            &mut params,
        )?;

        // 6) Contrastive engine
        let contrastive = ContrastiveLossEngine::new(
            config.ssl_temp,
            config.simple_ssl_temp,
            config.sampling.sampler(),
            n_users,
            n_items,
        )?;

        info!(
            "HDCL model built: {} parameter tensors, {} scalars",
            params.all_vars().len(),
            params.num_parameters()
        );

        Ok(HdclModel {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            training: true,
            graph,
            params,
            features,
            adjacency,
            interactions,
            propagation,
            user_metapath,
            item_metapath,
            regularizer,
            contrastive,
            user_similarity,
            item_similarity,
            config,
        })
    }
}

fn node_count(graph: &HeteroGraph, ntype: &str) -> Result<usize> {
    graph
        .num_nodes(ntype)
        .ok_or_else(|| HdclError::config("config", format!("node type '{}' not in graph", ntype)))
}

fn row_sums(m: &CsMat<f32>) -> Vec<f32> {
    m.outer_iterator().map(|row| row.data().iter().sum()).collect()
}
