//! Cluster hierarchy, head/tail split and anchor loss.

use std::collections::HashSet;

use candle_core::{Device, Tensor, Var};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::clustering::{
    kmeans_lloyd, AnchorSettings, ClusterAnchorRegularizer, ClusterHierarchy, Frozen, HeadTailSplit,
};
use crate::params::{Init, ParamStore};
use crate::tests::init;

fn random_rows(n: usize, f: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n).map(|_| (0..f).map(|_| rng.random::<f64>()).collect()).collect()
}

#[test]
fn test_kmeans_lloyd_separates_blobs() {
    init();
    let rows = vec![
        vec![0.0, 0.0],
        vec![0.1, 0.0],
        vec![0.0, 0.1],
        vec![10.0, 10.0],
        vec![10.1, 10.0],
        vec![10.0, 10.1],
    ];
    let labels = kmeans_lloyd(&rows, 2, 100, 42).unwrap();
    assert_eq!(labels.len(), 6);
    assert_eq!(labels[0], 0);
    assert!(labels[..3].iter().all(|&l| l == labels[0]));
    assert!(labels[3..].iter().all(|&l| l == labels[3]));
    assert_ne!(labels[0], labels[3]);
}

#[test]
fn test_kmeans_lloyd_degenerate_inputs() {
    init();
    assert!(kmeans_lloyd(&[], 3, 10, 1).unwrap().is_empty());
    let same = vec![vec![1.0, 1.0]; 5];
    assert_eq!(kmeans_lloyd(&same, 3, 10, 1).unwrap(), vec![0; 5]);
    let two = vec![vec![0.0], vec![1.0], vec![0.0]];
    assert_eq!(kmeans_lloyd(&two, 4, 10, 1).unwrap(), vec![0, 1, 0]);
}

#[test]
fn test_hierarchy_children_nest_in_parents() {
    init();
    let rows = random_rows(30, 3, 9);
    let h = ClusterHierarchy::build(&rows, 4, 3, 50, 42).unwrap();
    assert_eq!(h.depth(), 3);
    assert!(h.num_clusters(0) <= 4);

    for level in 0..h.depth() {
        let labels = h.labels(level);
        let anchor_labels = h.anchor_labels(level);
        assert_eq!(labels.len(), 30);
        let mut covered = 0;
        for node in h.level_nodes(level) {
            covered += node.members.len();
            assert!(node.local < h.anchor_rows(level));
            for &m in &node.members {
                assert_eq!(labels[m as usize] as usize, node.index);
                assert_eq!(anchor_labels[m as usize] as usize, node.local);
            }
            match node.parent {
                None => assert_eq!(level, 0),
                Some(p) => {
                    let parent = h.node(p);
                    assert_eq!(parent.level, level - 1);
                    let parent_members: HashSet<u32> = parent.members.iter().copied().collect();
                    assert!(node.members.iter().all(|m| parent_members.contains(m)));
                }
            }
        }
        assert_eq!(covered, 30);
    }
}

#[test]
fn test_singleton_parents_are_carried_down() {
    init();
    let rows = vec![vec![0.0, 0.0], vec![5.0, 5.0], vec![10.0, 0.0]];
    let h = ClusterHierarchy::build(&rows, 3, 2, 20, 1).unwrap();
    assert_eq!(h.num_clusters(0), 3);
    assert_eq!(h.num_clusters(1), 3);
    for node in h.level_nodes(1) {
        assert_eq!(node.members.len(), 1);
        let parent = h.node(node.parent.unwrap());
        assert_eq!(parent.members, node.members);
    }
}

#[test]
fn test_head_tail_split_uses_interpolated_percentile() {
    init();
    let split = HeadTailSplit::from_counts(&[1.0, 1.0, 1.0, 1.0, 10.0], 80.0);
    assert!((split.threshold - 2.8).abs() < 1e-5);
    assert_eq!(split.head, vec![4]);
    assert_eq!(split.tail, vec![0, 1, 2, 3]);

    let flat = HeadTailSplit::from_counts(&[3.0; 4], 80.0);
    assert_eq!(flat.head.len(), 4);
    assert!(flat.tail.is_empty());
}

struct Fixture {
    regularizer: ClusterAnchorRegularizer,
    user_emb: Var,
    item_emb: Var,
}

fn fixture(user_counts: &[f32], item_counts: &[f32], lambda_head: f64, lambda_tail: f64) -> Fixture {
    let mut params = ParamStore::new(&Device::Cpu, 5);
    let user_snap = params.matrix("snap.user", user_counts.len(), 4, Init::XavierUniform).unwrap();
    let item_snap = params.matrix("snap.item", item_counts.len(), 4, Init::XavierUniform).unwrap();
    let settings = AnchorSettings {
        dim: 4,
        num_clusters: 2,
        depth: 2,
        max_iter: 50,
        head_percentile: 80.0,
        lambda_head,
        lambda_tail,
        seed: 1,
    };
    let regularizer = ClusterAnchorRegularizer::new(
        &Frozen::of(user_snap.as_tensor()),
        &Frozen::of(item_snap.as_tensor()),
        user_counts,
        item_counts,
        &settings,
        &mut params,
    )
    .unwrap();
    let user_emb = params.matrix("emb.user", user_counts.len(), 4, Init::XavierUniform).unwrap();
    let item_emb = params.matrix("emb.item", item_counts.len(), 4, Init::XavierUniform).unwrap();
    Fixture {
        regularizer,
        user_emb,
        item_emb,
    }
}

fn abs_sum(t: &Tensor) -> f32 {
    t.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
}

const USER_COUNTS: [f32; 6] = [0.0, 0.0, 0.0, 0.0, 5.0, 10.0];
const ITEM_COUNTS: [f32; 5] = [0.0, 0.0, 0.0, 3.0, 9.0];

#[test]
fn test_anchor_matrices_per_level() {
    init();
    let fx = fixture(&USER_COUNTS, &ITEM_COUNTS, 0.01, 1.0);
    let reg = &fx.regularizer;
    // num_clusters = 2: two rows at level 0, one at level 1
    for (level, expected) in [(0, 2), (1, 1)] {
        let (rows, dim) = reg.user_anchors(level).dims2().unwrap();
        assert_eq!(rows, expected);
        assert_eq!(rows, reg.user_hierarchy().anchor_rows(level));
        assert_eq!(dim, 4);
        let (rows, _) = reg.item_anchors(level).dims2().unwrap();
        assert_eq!(rows, expected);
    }
}

#[test]
fn test_loss_is_non_negative() {
    init();
    let fx = fixture(&USER_COUNTS, &ITEM_COUNTS, 0.01, 1.0);
    let loss = fx
        .regularizer
        .loss_fused(fx.user_emb.as_tensor(), fx.item_emb.as_tensor())
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(loss.is_finite());
    assert!(loss > 0.0);
}

#[test]
fn test_empty_tail_contributes_zero() {
    init();
    // equal counts: everyone is head, nobody is tail
    let fx = fixture(&[2.0; 6], &[1.0; 5], 0.0, 1.0);
    let loss = fx
        .regularizer
        .loss_fused(fx.user_emb.as_tensor(), fx.item_emb.as_tensor())
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert_eq!(loss, 0.0);
}

#[test]
fn test_tail_term_moves_embeddings_not_anchors() {
    init();
    let fx = fixture(&USER_COUNTS, &ITEM_COUNTS, 0.0, 1.0);
    let loss = fx
        .regularizer
        .loss_fused(fx.user_emb.as_tensor(), fx.item_emb.as_tensor())
        .unwrap();
    let grads = loss.backward().unwrap();

    for level in 0..2 {
        if let Some(g) = grads.get(fx.regularizer.user_anchors(level).as_tensor()) {
            assert_eq!(abs_sum(g), 0.0);
        }
    }
    let g = grads.get(fx.user_emb.as_tensor()).unwrap();
    // users 0..4 are tail, 4 and 5 head
    assert!(abs_sum(&g.narrow(0, 0, 4).unwrap()) > 0.0);
    assert_eq!(abs_sum(&g.narrow(0, 4, 2).unwrap()), 0.0);
}

#[test]
fn test_head_term_moves_anchors_not_embeddings() {
    init();
    let fx = fixture(&USER_COUNTS, &ITEM_COUNTS, 1.0, 0.0);
    let loss = fx
        .regularizer
        .loss_fused(fx.user_emb.as_tensor(), fx.item_emb.as_tensor())
        .unwrap();
    let grads = loss.backward().unwrap();

    if let Some(g) = grads.get(fx.user_emb.as_tensor()) {
        assert_eq!(abs_sum(g), 0.0);
    }
    let anchor_grad = grads.get(fx.regularizer.user_anchors(0).as_tensor()).unwrap();
    assert!(abs_sum(anchor_grad) > 0.0);
}

#[test]
fn test_deeper_levels_share_anchor_rows_across_parents() {
    init();
    let mut params = ParamStore::new(&Device::Cpu, 3);
    let user_snap = params.matrix("snap.user", 40, 4, Init::XavierUniform).unwrap();
    let item_snap = params.matrix("snap.item", 6, 4, Init::XavierUniform).unwrap();
    // only user 0 is head
    let mut user_counts = vec![1.0f32; 40];
    user_counts[0] = 50.0;
    let settings = AnchorSettings {
        dim: 4,
        num_clusters: 8,
        depth: 2,
        max_iter: 50,
        head_percentile: 99.0,
        lambda_head: 1.0,
        lambda_tail: 1.0,
        seed: 2,
    };
    let reg = ClusterAnchorRegularizer::new(
        &Frozen::of(user_snap.as_tensor()),
        &Frozen::of(item_snap.as_tensor()),
        &user_counts,
        &[1.0; 6],
        &settings,
        &mut params,
    )
    .unwrap();

    let h = reg.user_hierarchy();
    assert!(h.num_clusters(0) <= 8);
    assert!(h.num_clusters(1) >= h.num_clusters(0));
    assert_eq!(reg.user_anchors(0).dims2().unwrap(), (8, 4));
    assert_eq!(reg.user_anchors(1).dims2().unwrap(), (4, 4));
    assert!(h.anchor_labels(1).iter().all(|&l| l < 4));

    let user_emb = params.matrix("emb.user", 40, 4, Init::XavierUniform).unwrap();
    let item_emb = params.matrix("emb.item", 6, 4, Init::XavierUniform).unwrap();
    let loss = reg.loss_fused(user_emb.as_tensor(), item_emb.as_tensor()).unwrap();
    assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    let grads = loss.backward().unwrap();
    let g = grads.get(reg.user_anchors(1).as_tensor()).unwrap();
    let head_slot = h.anchor_labels(1)[0] as usize;
    assert!(abs_sum(&g.narrow(0, head_slot, 1).unwrap()) > 0.0);
}
