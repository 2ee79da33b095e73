//! Hierarchical clustering of entity snapshots and the cluster-anchor regularizer.
//!
//! The hierarchy is an arena of [`ClusterNode`]s. Level 0 partitions every
//! entity with k-means; each deeper level sub-clusters the members of every
//! parent node with `max(num_clusters >> level, 1)` clusters (capped by the
//! parent's population). Parents with at most one member are carried down as a
//! single child. Node ids are global within a level, so every level-`l+1`
//! node is contained in exactly one level-`l` node. Each node also keeps its
//! position among its siblings; that local slot selects the anchor row, so the
//! anchor matrix of level `l` has `max(num_clusters >> l, 1)` rows shared by
//! the children of every parent.
//!
//! **DETERMINISTIC**: k-means seeds are derived from the configured seed and the
//! parent node id.
//!
//! The regularizer owns one learnable anchor matrix per level and side. For a
//! fused embedding `E` and anchors `A`:
//!
//! ```text
//! L_S = mean( (A[label(h)] - frozen(E[h]))^2 )   over head entities h
//! L_T = mean( (E[t] - frozen(A[label(t)]))^2 )   over tail entities t
//! CAR = sum_l 1/(l+1) · (lambda_H · L_S + lambda_T · L_T)
//! ```
//!
//! with user and item terms averaged per level and empty partitions
//! contributing zero.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use log::{debug, info, trace, warn};
use smartcore::cluster::kmeans::{KMeans, KMeansParameters};
use smartcore::linalg::basic::arrays::Array2;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{HdclError, Result};
use crate::params::{Init, ParamStore};

/// Perform K-Means clustering using Lloyd's algorithm.
///
/// Returns labels compacted to `0..k'` in order of first appearance, where
/// `k' <= min(k, rows.len())`. Inputs with at most `k` distinct rows are
/// labelled by distinct row without running k-means.
pub fn kmeans_lloyd(rows: &[Vec<f64>], k: usize, max_iter: usize, seed: u64) -> Result<Vec<usize>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let (n, f) = (rows.len(), rows[0].len());
    let k = k.min(n).max(1);
    if k == 1 {
        return Ok(vec![0; n]);
    }

    let mut distinct: BTreeMap<Vec<u64>, usize> = BTreeMap::new();
    let keys: Vec<Vec<u64>> = rows
        .iter()
        .map(|r| r.iter().map(|v| v.to_bits()).collect())
        .collect();
    for key in &keys {
        let next = distinct.len();
        distinct.entry(key.clone()).or_insert(next);
    }
    if distinct.len() <= k {
        trace!("kmeans: {} distinct rows <= k={}, labelling directly", distinct.len(), k);
        let labels = keys.iter().map(|key| distinct[key]).collect();
        return Ok(compact_labels(labels));
    }

    let x: DenseMatrix<f64> =
        DenseMatrix::from_iterator(rows.iter().flatten().copied(), n, f, 0);
    let params = KMeansParameters {
        k,
        max_iter,
        seed: Some(seed),
    };
    let km: KMeans<f64, usize, DenseMatrix<f64>, Vec<usize>> =
        KMeans::fit(&x, params).map_err(|e| HdclError::Clustering(e.to_string()))?;
    let labels = km
        .predict(&x)
        .map_err(|e| HdclError::Clustering(e.to_string()))?;
    Ok(compact_labels(labels))
}

fn compact_labels(labels: Vec<usize>) -> Vec<usize> {
    let mut remap: BTreeMap<usize, usize> = BTreeMap::new();
    labels
        .into_iter()
        .map(|l| {
            let next = remap.len();
            *remap.entry(l).or_insert(next)
        })
        .collect()
}

/// One cluster at one level of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub level: usize,
    /// Position of this node among the nodes of its level.
    pub index: usize,
    /// Position among the children of its parent (anchor row).
    pub local: usize,
    /// Arena id of the parent node, `None` at level 0.
    pub parent: Option<usize>,
    pub members: Vec<u32>,
}

/// Arena of cluster nodes plus per-level entity labels.
#[derive(Debug, Clone)]
pub struct ClusterHierarchy {
    nodes: Vec<ClusterNode>,
    /// Arena ids of the nodes of each level, in anchor-row order.
    levels: Vec<Vec<usize>>,
    /// `labels[level][entity]` = level-wide index of the entity's cluster.
    labels: Vec<Vec<u32>>,
    /// `anchor_labels[level][entity]` = local slot of the entity's cluster.
    anchor_labels: Vec<Vec<u32>>,
    num_clusters: usize,
    n_entities: usize,
}

impl ClusterHierarchy {
    pub fn build(
        snapshot: &[Vec<f64>],
        num_clusters: usize,
        depth: usize,
        max_iter: usize,
        seed: u64,
    ) -> Result<Self> {
        let n = snapshot.len();
        let mut hierarchy = Self {
            nodes: Vec::new(),
            levels: Vec::with_capacity(depth),
            labels: Vec::with_capacity(depth),
            anchor_labels: Vec::with_capacity(depth),
            num_clusters,
            n_entities: n,
        };

        for level in 0..depth {
            let k = clusters_at_level(num_clusters, level);
            let parents: Vec<Option<usize>> = if level == 0 {
                vec![None]
            } else {
                hierarchy.levels[level - 1].iter().map(|&id| Some(id)).collect()
            };

            let mut level_ids = Vec::new();
            let mut level_labels = vec![0u32; n];
            let mut level_anchor_labels = vec![0u32; n];
            for parent in parents {
                let members: Vec<u32> = match parent {
                    None => (0..n as u32).collect(),
                    Some(id) => hierarchy.nodes[id].members.clone(),
                };
                if members.is_empty() {
                    continue;
                }
                let groups = if members.len() <= 1 {
                    vec![members]
                } else {
                    let rows: Vec<Vec<f64>> =
                        members.iter().map(|&m| snapshot[m as usize].clone()).collect();
                    let node_seed = seed.wrapping_add(parent.map_or(0, |p| p as u64 + 1));
                    let labels = kmeans_lloyd(&rows, k, max_iter, node_seed)?;
                    group_members(&members, &labels)
                };
                for (local, group) in groups.into_iter().enumerate() {
                    let index = level_ids.len();
                    for &m in &group {
                        level_labels[m as usize] = index as u32;
                        level_anchor_labels[m as usize] = local as u32;
                    }
                    level_ids.push(hierarchy.nodes.len());
                    hierarchy.nodes.push(ClusterNode {
                        level,
                        index,
                        local,
                        parent,
                        members: group,
                    });
                }
            }
            debug!("cluster level {}: k={} -> {} clusters", level, k, level_ids.len());
            hierarchy.levels.push(level_ids);
            hierarchy.labels.push(level_labels);
            hierarchy.anchor_labels.push(level_anchor_labels);
        }

        info!(
            "Built cluster hierarchy over {} entities: {} levels, {} nodes",
            n,
            depth,
            hierarchy.nodes.len()
        );
        Ok(hierarchy)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn n_entities(&self) -> usize {
        self.n_entities
    }

    pub fn node(&self, id: usize) -> &ClusterNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Nodes of `level` in anchor-row order.
    pub fn level_nodes(&self, level: usize) -> impl Iterator<Item = &ClusterNode> {
        self.levels[level].iter().map(move |&id| &self.nodes[id])
    }

    pub fn num_clusters(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn labels(&self, level: usize) -> &[u32] {
        &self.labels[level]
    }

    /// Anchor row of every entity at `level`.
    pub fn anchor_labels(&self, level: usize) -> &[u32] {
        &self.anchor_labels[level]
    }

    /// Rows of the anchor matrix at `level`.
    pub fn anchor_rows(&self, level: usize) -> usize {
        clusters_at_level(self.num_clusters, level)
    }
}

fn clusters_at_level(num_clusters: usize, level: usize) -> usize {
    num_clusters
        .checked_shr(level as u32)
        .unwrap_or(0)
        .max(1)
}

fn group_members(members: &[u32], labels: &[usize]) -> Vec<Vec<u32>> {
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut groups = vec![Vec::new(); k];
    for (&m, &l) in members.iter().zip(labels) {
        groups[l].push(m);
    }
    groups
}

/// Value with no backpropagation path, used as the fixed side of a loss term.
#[derive(Debug, Clone)]
pub struct Frozen(Tensor);

impl Frozen {
    pub fn of(t: &Tensor) -> Self {
        Frozen(t.detach())
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}

/// numpy-style percentile with linear interpolation, `q` in `[0, 100]`.
pub fn percentile(values: &[f32], q: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Entities split by interaction count against a percentile threshold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadTailSplit {
    pub head: Vec<u32>,
    pub tail: Vec<u32>,
    pub threshold: f32,
}

impl HeadTailSplit {
    pub fn from_counts(counts: &[f32], head_percentile: f64) -> Self {
        let threshold = percentile(counts, head_percentile);
        let (mut head, mut tail) = (Vec::new(), Vec::new());
        for (i, &c) in counts.iter().enumerate() {
            if c >= threshold {
                head.push(i as u32);
            } else {
                tail.push(i as u32);
            }
        }
        Self {
            head,
            tail,
            threshold,
        }
    }
}

/// Hierarchy, anchors and head/tail split of one entity side (users or items).
struct SideAnchors {
    name: &'static str,
    hierarchy: ClusterHierarchy,
    anchors: Vec<Var>,
    head: Option<Tensor>,
    tail: Option<Tensor>,
    head_labels: Vec<Option<Tensor>>,
    tail_labels: Vec<Option<Tensor>>,
}

impl SideAnchors {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &'static str,
        snapshot: &[Vec<f64>],
        counts: &[f32],
        dim: usize,
        num_clusters: usize,
        depth: usize,
        max_iter: usize,
        head_percentile: f64,
        seed: u64,
        params: &mut ParamStore,
    ) -> Result<Self> {
        if snapshot.len() != counts.len() {
            return Err(HdclError::shape(
                "cluster-init",
                format!("{} {} interaction counts", snapshot.len(), name),
                counts.len(),
            ));
        }
        let hierarchy = ClusterHierarchy::build(snapshot, num_clusters, depth, max_iter, seed)?;
        let split = HeadTailSplit::from_counts(counts, head_percentile);
        debug!(
            "{}: {} head / {} tail (threshold {})",
            name,
            split.head.len(),
            split.tail.len(),
            split.threshold
        );
        if split.head.is_empty() || split.tail.is_empty() {
            warn!(
                "{} head/tail partition has an empty side ({} head, {} tail); that term contributes 0",
                name,
                split.head.len(),
                split.tail.len()
            );
        }

        let device = params.device().clone();
        let mut anchors = Vec::with_capacity(depth);
        let mut head_labels = Vec::with_capacity(depth);
        let mut tail_labels = Vec::with_capacity(depth);
        for level in 0..depth {
            let rows = hierarchy.anchor_rows(level);
            anchors.push(params.matrix(
                &format!("anchors.{}.level_{}", name, level),
                rows,
                dim,
                Init::XavierUniform,
            )?);
            let labels = hierarchy.anchor_labels(level);
            head_labels.push(index_tensor(split.head.iter().map(|&e| labels[e as usize]), &device)?);
            tail_labels.push(index_tensor(split.tail.iter().map(|&e| labels[e as usize]), &device)?);
        }

        Ok(Self {
            name,
            head: index_tensor(split.head.iter().copied(), &device)?,
            tail: index_tensor(split.tail.iter().copied(), &device)?,
            hierarchy,
            anchors,
            head_labels,
            tail_labels,
        })
    }

    /// `(L_S, L_T)` of this side at `level`, `None` for an empty partition.
    fn level_terms(&self, level: usize, fused: &Tensor) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let anchors = self.anchors[level].as_tensor();
        let source = match (&self.head, &self.head_labels[level]) {
            (Some(ids), Some(labels)) => {
                let target = Frozen::of(&fused.index_select(ids, 0)?);
                let pulled = anchors.index_select(labels, 0)?;
                Some(pulled.sub(target.tensor())?.sqr()?.mean_all()?)
            }
            _ => None,
        };
        let target = match (&self.tail, &self.tail_labels[level]) {
            (Some(ids), Some(labels)) => {
                let anchor = Frozen::of(&anchors.index_select(labels, 0)?);
                let pulled = fused.index_select(ids, 0)?;
                Some(pulled.sub(anchor.tensor())?.sqr()?.mean_all()?)
            }
            _ => None,
        };
        trace!("{} level {}: L_S present={}, L_T present={}", self.name, level, source.is_some(), target.is_some());
        Ok((source, target))
    }
}

fn index_tensor(ids: impl Iterator<Item = u32>, device: &Device) -> Result<Option<Tensor>> {
    let ids: Vec<u32> = ids.collect();
    if ids.is_empty() {
        return Ok(None);
    }
    let len = ids.len();
    Ok(Some(Tensor::from_vec(ids, len, device)?))
}

/// Average of the user and item terms, absent terms counted as zero.
fn side_average(user: Option<Tensor>, item: Option<Tensor>, device: &Device) -> Result<Tensor> {
    Ok(match (user, item) {
        (Some(u), Some(i)) => u.add(&i)?.affine(0.5, 0.0)?,
        (Some(t), None) | (None, Some(t)) => t.affine(0.5, 0.0)?,
        (None, None) => Tensor::zeros((), DType::F32, device)?,
    })
}

/// Settings of the anchor regularizer taken from the model configuration.
#[derive(Debug, Clone)]
pub struct AnchorSettings {
    pub dim: usize,
    pub num_clusters: usize,
    pub depth: usize,
    pub max_iter: usize,
    pub head_percentile: f64,
    pub lambda_head: f64,
    pub lambda_tail: f64,
    pub seed: u64,
}

pub struct ClusterAnchorRegularizer {
    user: SideAnchors,
    item: SideAnchors,
    lambda_head: f64,
    lambda_tail: f64,
    depth: usize,
}

impl ClusterAnchorRegularizer {
    /// Clusters the frozen user/item snapshots and allocates anchors in `params`.
    ///
    /// `user_counts`/`item_counts` are per-entity interaction counts.
    pub fn new(
        user_snapshot: &Frozen,
        item_snapshot: &Frozen,
        user_counts: &[f32],
        item_counts: &[f32],
        settings: &AnchorSettings,
        params: &mut ParamStore,
    ) -> Result<Self> {
        let user_rows = to_rows(user_snapshot)?;
        let item_rows = to_rows(item_snapshot)?;
        info!(
            "Initialising cluster anchors: {} users, {} items, {} clusters, {} levels",
            user_rows.len(),
            item_rows.len(),
            settings.num_clusters,
            settings.depth
        );
        let user = SideAnchors::new(
            "user",
            &user_rows,
            user_counts,
            settings.dim,
            settings.num_clusters,
            settings.depth,
            settings.max_iter,
            settings.head_percentile,
            settings.seed,
            params,
        )?;
        let item = SideAnchors::new(
            "item",
            &item_rows,
            item_counts,
            settings.dim,
            settings.num_clusters,
            settings.depth,
            settings.max_iter,
            settings.head_percentile,
            settings.seed.wrapping_add(1 << 32),
            params,
        )?;
        Ok(Self {
            user,
            item,
            lambda_head: settings.lambda_head,
            lambda_tail: settings.lambda_tail,
            depth: settings.depth,
        })
    }

    pub fn user_hierarchy(&self) -> &ClusterHierarchy {
        &self.user.hierarchy
    }

    pub fn item_hierarchy(&self) -> &ClusterHierarchy {
        &self.item.hierarchy
    }

    pub fn user_anchors(&self, level: usize) -> &Var {
        &self.user.anchors[level]
    }

    pub fn item_anchors(&self, level: usize) -> &Var {
        &self.item.anchors[level]
    }

    /// Loss on the already fused user/item embeddings.
    pub fn loss_fused(&self, user_fused: &Tensor, item_fused: &Tensor) -> Result<Tensor> {
        let device = user_fused.device();
        let mut total = Tensor::zeros((), DType::F32, device)?;
        for level in 0..self.depth {
            let (us, ut) = self.user.level_terms(level, user_fused)?;
            let (is, it) = self.item.level_terms(level, item_fused)?;
            let l_s = side_average(us, is, device)?;
            let l_t = side_average(ut, it, device)?;
            let weight = 1.0 / (level as f64 + 1.0);
            let level_loss = l_s
                .affine(weight * self.lambda_head, 0.0)?
                .add(&l_t.affine(weight * self.lambda_tail, 0.0)?)?;
            total = total.add(&level_loss)?;
        }
        Ok(total)
    }

    /// Fuses `0.5 · structural + 0.5 · metapath` per side, then applies [`Self::loss_fused`].
    pub fn loss(
        &self,
        user_structural: &Tensor,
        user_metapath: &Tensor,
        item_structural: &Tensor,
        item_metapath: &Tensor,
    ) -> Result<Tensor> {
        let user = fuse(user_structural, user_metapath)?;
        let item = fuse(item_structural, item_metapath)?;
        self.loss_fused(&user, &item)
    }
}

/// `0.5 · a + 0.5 · b`.
pub fn fuse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(a.add(b)?.affine(0.5, 0.0)?)
}

fn to_rows(snapshot: &Frozen) -> Result<Vec<Vec<f64>>> {
    let rows = snapshot.tensor().to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let non_finite = rows
        .iter()
        .filter(|r| r.iter().any(|v| !v.is_finite()))
        .count();
    if non_finite > 0 {
        return Err(HdclError::DegenerateInput {
            component: "cluster-init",
            message: format!("{} snapshot rows contain non-finite values", non_finite),
        });
    }
    Ok(rows)
}
