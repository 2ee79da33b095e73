//! The HDCL model: structural propagation, metapath aggregation, cluster-anchor
//! regularization and structured contrastive learning behind one `forward`.
//!
//! Per type the fused embedding is `0.5 · structural + 0.5 · metapath`. The
//! contrastive loss contrasts the metapath table (view 1) against the
//! structural table (view 2) over the joint `[users; items]` index space, and
//! is extended with
//!
//! ```text
//! beta · ( align(S, M) + ts · align(V1, V2) + unif(S, M) + ts · unif(V1, V2) )
//! ```
//!
//! averaged over the user and item sides of the batch, where `S`/`M` are the
//! structural/metapath rows and `V1`/`V2` the two perturbed propagation views.
//!
//! Models are built through [`crate::builder::HdclBuilder`].

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};
use log::{debug, trace};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sprs::CsMat;

use crate::adjacency::NormalizedAdjacency;
use crate::clustering::{fuse, ClusterAnchorRegularizer};
use crate::config::HdclConfig;
use crate::contrastive::ContrastiveLossEngine;
use crate::error::{HdclError, Result};
use crate::hetero::HeteroGraph;
use crate::metapath::MetapathEncoder;
use crate::params::ParamStore;
use crate::propagation::{PropagationEncoder, PropagationOutput};
use crate::similarity::SimilarityIndex;

/// Selected fused embeddings and auxiliary losses of one batch.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub user_emb: Tensor,
    pub item_emb: Tensor,
    pub neg_item_emb: Tensor,
    pub ssl_loss: Tensor,
    pub car_loss: Tensor,
}

/// BPR objective of one batch.
#[derive(Debug, Clone)]
pub struct RankingLoss {
    /// `bpr + cl_rate · ssl + car`.
    pub loss: Tensor,
    /// `0.5 · (|u|^2 + |p|^2 + |n|^2) / batch`, weighted by the caller.
    pub reg_loss: Tensor,
    pub bpr_loss: Tensor,
    pub ssl_loss: Tensor,
    pub car_loss: Tensor,
}

pub struct HdclModel {
    pub(crate) config: HdclConfig,
    pub(crate) graph: HeteroGraph,
    pub(crate) params: ParamStore,
    pub(crate) features: BTreeMap<String, Var>,
    pub(crate) adjacency: NormalizedAdjacency,
    pub(crate) interactions: CsMat<f32>,
    pub(crate) propagation: PropagationEncoder,
    pub(crate) user_metapath: MetapathEncoder,
    pub(crate) item_metapath: MetapathEncoder,
    pub(crate) regularizer: ClusterAnchorRegularizer,
    pub(crate) contrastive: ContrastiveLossEngine,
    pub(crate) user_similarity: SimilarityIndex,
    pub(crate) item_similarity: SimilarityIndex,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) training: bool,
}

impl HdclModel {
    pub fn config(&self) -> &HdclConfig {
        &self.config
    }

    pub fn graph(&self) -> &HeteroGraph {
        &self.graph
    }

    pub fn n_users(&self) -> usize {
        self.adjacency.n_users
    }

    pub fn n_items(&self) -> usize {
        self.adjacency.n_items
    }

    pub fn adjacency(&self) -> &NormalizedAdjacency {
        &self.adjacency
    }

    /// Binary `users x items` training interactions.
    pub fn interactions(&self) -> &CsMat<f32> {
        &self.interactions
    }

    pub fn propagation(&self) -> &PropagationEncoder {
        &self.propagation
    }

    pub fn user_metapath(&self) -> &MetapathEncoder {
        &self.user_metapath
    }

    pub fn item_metapath(&self) -> &MetapathEncoder {
        &self.item_metapath
    }

    pub fn regularizer(&self) -> &ClusterAnchorRegularizer {
        &self.regularizer
    }

    pub fn contrastive(&self) -> &ContrastiveLossEngine {
        &self.contrastive
    }

    pub fn user_similarity(&self) -> &SimilarityIndex {
        &self.user_similarity
    }

    pub fn item_similarity(&self) -> &SimilarityIndex {
        &self.item_similarity
    }

    /// Learnable node features of `ntype`.
    pub fn features(&self, ntype: &str) -> Option<&Var> {
        self.features.get(ntype)
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Every learnable variable, for the optimiser.
    pub fn all_vars(&self) -> Vec<Var> {
        self.params.all_vars()
    }

    /// Restarts the noise/sampling/dropout stream.
    pub fn reseed(&mut self, seed: u64) {
        debug!("Reseeding model rng with {}", seed);
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Toggles dropout on metapath embeddings.
    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn user_index(&self, ids: &[u32]) -> Result<Tensor> {
        index_tensor(ids, self.n_users(), "user", &self.params)
    }

    fn item_index(&self, ids: &[u32]) -> Result<Tensor> {
        index_tensor(ids, self.n_items(), "item", &self.params)
    }

    /// Metapath tables; dropout only when `training`.
    fn metapath_embeddings(&mut self, training: bool) -> Result<(Tensor, Tensor)> {
        let user_features = self.feature_tensor(&self.config.user_key)?;
        let item_features = self.feature_tensor(&self.config.item_key)?;
        let user = self
            .user_metapath
            .forward(&self.graph, &user_features, training, &mut self.rng)?;
        let item = self
            .item_metapath
            .forward(&self.graph, &item_features, training, &mut self.rng)?;
        Ok((user, item))
    }

    fn feature_tensor(&self, ntype: &str) -> Result<Tensor> {
        self.features
            .get(ntype)
            .map(|v| v.as_tensor().clone())
            .ok_or_else(|| HdclError::config("model", format!("no features for '{}'", ntype)))
    }

    /// Full-table embeddings: `(propagation output, metapath users, metapath items)`.
    pub fn encode(&mut self) -> Result<(PropagationOutput, Tensor, Tensor)> {
        let prop = self.propagation.forward(&mut self.rng)?;
        let (h_user, h_item) = self.metapath_embeddings(self.training)?;
        Ok((prop, h_user, h_item))
    }

    pub fn forward(&mut self, user_idx: &[u32], item_idx: &[u32], neg_item_idx: &[u32]) -> Result<ForwardOutput> {
        if user_idx.len() != item_idx.len() || user_idx.len() != neg_item_idx.len() {
            return Err(HdclError::shape(
                "model",
                format!("{} users, items and negatives", user_idx.len()),
                format!("{} items, {} negatives", item_idx.len(), neg_item_idx.len()),
            ));
        }
        let users = self.user_index(user_idx)?;
        let items = self.item_index(item_idx)?;
        let negs = self.item_index(neg_item_idx)?;

        let (prop, h_user, h_item) = self.encode()?;
        let user_fused = fuse(&prop.user_base, &h_user)?;
        let item_fused = fuse(&prop.item_base, &h_item)?;

        let car_loss = self.regularizer.loss_fused(&user_fused, &item_fused)?;

        let view1 = Tensor::cat(&[&h_user, &h_item], 0)?;
        let view2 = Tensor::cat(&[&prop.user_base, &prop.item_base], 0)?;
        let pairs = self.contrastive.build_positive_pairs(
            user_idx,
            item_idx,
            &self.user_similarity,
            &self.item_similarity,
            &mut self.rng,
        )?;
        let mut ssl_loss = self.contrastive.structured_loss(&view1, &view2, &pairs)?;

        let (align_u, unif_u) = self
            .contrastive
            .alignment_uniformity(&prop.user_base.index_select(&users, 0)?, &h_user.index_select(&users, 0)?)?;
        let (align_i, unif_i) = self
            .contrastive
            .alignment_uniformity(&prop.item_base.index_select(&items, 0)?, &h_item.index_select(&items, 0)?)?;
        let (valign_u, vunif_u) = self.contrastive.alignment_uniformity(
            &prop.user_view1.index_select(&users, 0)?,
            &prop.user_view2.index_select(&users, 0)?,
        )?;
        let (valign_i, vunif_i) = self.contrastive.alignment_uniformity(
            &prop.item_view1.index_select(&items, 0)?,
            &prop.item_view2.index_select(&items, 0)?,
        )?;
        let ts = self.config.ts;
        let align = align_u
            .add(&align_i)?
            .affine(0.5, 0.0)?
            .add(&valign_u.add(&valign_i)?.affine(0.5 * ts, 0.0)?)?;
        let uniform = unif_u
            .add(&unif_i)?
            .affine(0.5, 0.0)?
            .add(&vunif_u.add(&vunif_i)?.affine(0.5 * ts, 0.0)?)?;
        ssl_loss = ssl_loss.add(&align.add(&uniform)?.affine(self.config.beta, 0.0)?)?;
        trace!("forward: {} positive pairs, batch {}", pairs.len(), user_idx.len());

        Ok(ForwardOutput {
            user_emb: user_fused.index_select(&users, 0)?,
            item_emb: item_fused.index_select(&items, 0)?,
            neg_item_emb: item_fused.index_select(&negs, 0)?,
            ssl_loss,
            car_loss,
        })
    }

    /// BPR loss plus weighted contrastive and cluster-anchor terms.
    pub fn ranking_loss(&mut self, users: &[u32], pos: &[u32], neg: &[u32]) -> Result<RankingLoss> {
        let out = self.forward(users, pos, neg)?;
        let batch = users.len().max(1) as f64;
        let reg_loss = out
            .user_emb
            .sqr()?
            .sum_all()?
            .add(&out.item_emb.sqr()?.sum_all()?)?
            .add(&out.neg_item_emb.sqr()?.sum_all()?)?
            .affine(0.5 / batch, 0.0)?;
        let pos_scores = out.user_emb.mul(&out.item_emb)?.sum(1)?;
        let neg_scores = out.user_emb.mul(&out.neg_item_emb)?.sum(1)?;
        let bpr_loss = softplus(&neg_scores.sub(&pos_scores)?)?.mean_all()?;
        let loss = bpr_loss
            .add(&out.ssl_loss.affine(self.config.cl_rate, 0.0)?)?
            .add(&out.car_loss)?;
        Ok(RankingLoss {
            loss,
            reg_loss,
            bpr_loss,
            ssl_loss: out.ssl_loss,
            car_loss: out.car_loss,
        })
    }

    /// Clean fused tables for scoring: no noise, no dropout, no rng use.
    fn fused_tables(&mut self) -> Result<(Tensor, Tensor)> {
        let (user_base, item_base) = self.propagation.forward_base()?;
        let (h_user, h_item) = self.metapath_embeddings(false)?;
        Ok((fuse(&user_base, &h_user)?, fuse(&item_base, &h_item)?))
    }

    /// Fused embeddings of the given users and items.
    pub fn predict(&mut self, user_idx: &[u32], item_idx: &[u32]) -> Result<(Tensor, Tensor)> {
        let users = self.user_index(user_idx)?;
        let items = self.item_index(item_idx)?;
        let (user_fused, item_fused) = self.fused_tables()?;
        Ok((user_fused.index_select(&users, 0)?, item_fused.index_select(&items, 0)?))
    }

    /// `(batch, n_items)` dot-product scores against every item.
    pub fn rate_all_items(&mut self, user_idx: &[u32]) -> Result<Tensor> {
        let users = self.user_index(user_idx)?;
        let (user_fused, item_fused) = self.fused_tables()?;
        let user_emb = user_fused.index_select(&users, 0)?;
        Ok(user_emb.matmul(&item_fused.t()?)?)
    }
}

fn index_tensor(ids: &[u32], bound: usize, what: &str, params: &ParamStore) -> Result<Tensor> {
    if let Some(&bad) = ids.iter().find(|&&i| i as usize >= bound) {
        return Err(HdclError::shape("model", format!("{} ids < {}", what, bound), bad));
    }
    Ok(Tensor::from_vec(ids.to_vec(), ids.len(), params.device())?)
}

/// `log(1 + exp(x))` computed as `relu(x) + log(1 + exp(-|x|))`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(x.relu()?.add(&tail)?)
}
