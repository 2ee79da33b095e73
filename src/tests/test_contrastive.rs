//! Positive-pair construction and the contrastive objectives.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::contrastive::{alignment, uniformity, ContrastiveLossEngine};
use crate::error::HdclError;
use crate::sampling::{ProbabilisticSampler, UniformSampler};
use crate::similarity::{SimilarityAxis, SimilarityIndex, SimilarityNeighborList};
use crate::tests::init;

fn list(neighbors: &[u32], weights: &[f32]) -> SimilarityNeighborList {
    SimilarityNeighborList {
        neighbors: neighbors.to_vec(),
        weights: weights.to_vec(),
    }
}

fn indices() -> (SimilarityIndex, SimilarityIndex) {
    let users = SimilarityIndex {
        axis: SimilarityAxis::User,
        lists: vec![list(&[1], &[0.9]), list(&[0, 2], &[0.5, 0.5]), list(&[], &[])],
    };
    let items = SimilarityIndex {
        axis: SimilarityAxis::Item,
        lists: vec![list(&[2], &[1.0]), list(&[], &[]), list(&[0], &[1.0])],
    };
    (users, items)
}

fn engine() -> ContrastiveLossEngine {
    ContrastiveLossEngine::new(0.1, 0.5, Box::new(ProbabilisticSampler), 3, 3).unwrap()
}

fn random_view(seed: u64) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data: Vec<f32> = (0..24).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(data, (6, 4), &Device::Cpu).unwrap()
}

fn scalar(t: &Tensor) -> f32 {
    t.to_scalar::<f32>().unwrap()
}

#[test]
fn test_positive_pairs_layout() {
    init();
    let (user_sim, item_sim) = indices();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let pairs = engine()
        .build_positive_pairs(&[0, 2], &[0, 1], &user_sim, &item_sim, &mut rng)
        .unwrap();

    assert_eq!(pairs.sources, vec![0, 3, 1, 2, 4, 3, 0, 5, 4, 2]);
    assert_eq!(pairs.anchors, vec![0, 0, 0, 2, 2, 3, 3, 3, 4, 4]);
    assert_eq!(pairs.weights, vec![1.0; 10]);
    assert_eq!(pairs.batch_nodes, vec![0, 2, 3, 4]);
    assert_eq!(pairs.skipped_neighbors, 2);
    // every anchor appears among the denominator nodes
    assert!(pairs.anchors.iter().all(|a| pairs.batch_nodes.contains(a)));
}

#[test]
fn test_positive_pairs_reproducible_per_seed() {
    init();
    let (user_sim, item_sim) = indices();
    let engine = ContrastiveLossEngine::new(0.1, 0.5, Box::new(UniformSampler), 3, 3).unwrap();
    let run = |seed| {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        engine
            .build_positive_pairs(&[1, 1, 1, 1], &[0, 2, 0, 2], &user_sim, &item_sim, &mut rng)
            .unwrap()
    };
    assert_eq!(run(11), run(11));
    let pairs = run(11);
    // user 1 neighbours are {0, 2}
    for (s, a) in pairs.sources.iter().zip(&pairs.anchors) {
        if *a == 1 && *s < 3 && *s != 1 {
            assert!(*s == 0 || *s == 2);
        }
    }
}

#[test]
fn test_positive_pairs_rejects_bad_batches() {
    init();
    let (user_sim, item_sim) = indices();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let e = engine();

    let err = e
        .build_positive_pairs(&[0, 1], &[0], &user_sim, &item_sim, &mut rng)
        .unwrap_err();
    assert!(matches!(err, HdclError::ShapeMismatch { .. }));

    let err = e
        .build_positive_pairs(&[3], &[0], &user_sim, &item_sim, &mut rng)
        .unwrap_err();
    assert!(matches!(err, HdclError::ShapeMismatch { .. }));

    let err = e
        .build_positive_pairs(&[0], &[7], &user_sim, &item_sim, &mut rng)
        .unwrap_err();
    assert!(matches!(err, HdclError::ShapeMismatch { .. }));
}

#[test]
fn test_temperatures_must_be_positive() {
    init();
    assert!(ContrastiveLossEngine::new(0.0, 0.5, Box::new(UniformSampler), 1, 1).is_err());
    assert!(ContrastiveLossEngine::new(0.2, -1.0, Box::new(UniformSampler), 1, 1).is_err());
    assert!(ContrastiveLossEngine::new(f64::NAN, 0.5, Box::new(UniformSampler), 1, 1).is_err());
}

#[test]
fn test_structured_loss_is_non_negative() {
    init();
    let (user_sim, item_sim) = indices();
    let e = engine();
    for seed in 0..5 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pairs = e
            .build_positive_pairs(&[0, 1, 2], &[0, 1, 2], &user_sim, &item_sim, &mut rng)
            .unwrap();
        let loss = scalar(&e.structured_loss(&random_view(seed), &random_view(seed + 100), &pairs).unwrap());
        assert!(loss.is_finite());
        assert!(loss >= -1e-5, "loss {}", loss);
    }
}

#[test]
fn test_structured_loss_prefers_aligned_views() {
    init();
    let (user_sim, item_sim) = indices();
    let e = engine();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let pairs = e
        .build_positive_pairs(&[0, 2], &[0, 1], &user_sim, &item_sim, &mut rng)
        .unwrap();

    // one-hot rows: a node is only similar to itself
    let eye = Tensor::eye(6, candle_core::DType::F32, &Device::Cpu).unwrap();
    let aligned = scalar(&e.structured_loss(&eye, &eye, &pairs).unwrap());
    let flipped = scalar(&e.structured_loss(&eye, &eye.neg().unwrap(), &pairs).unwrap());
    assert!(aligned < flipped);
}

#[test]
fn test_empty_pairs_give_zero_loss() {
    init();
    let e = engine();
    let v = random_view(0);
    let loss = scalar(&e.structured_loss(&v, &v, &Default::default()).unwrap());
    assert_eq!(loss, 0.0);
}

#[test]
fn test_info_nce_single_row_is_zero() {
    init();
    let e = engine();
    let v1 = random_view(1);
    let v2 = random_view(2);
    let loss = scalar(&e.info_nce(&v1, &v2, &[4, 4, 4]).unwrap());
    assert!(loss.abs() < 1e-5);
    let loss = scalar(&e.info_nce(&v1, &v2, &[0, 1, 2, 5]).unwrap());
    assert!(loss.is_finite() && loss >= 0.0);
}

#[test]
fn test_alignment_bounds() {
    init();
    let x = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0]], &Device::Cpu).unwrap();
    assert!(scalar(&alignment(&x, &x).unwrap()).abs() < 1e-6);
    let opposite = scalar(&alignment(&x, &x.neg().unwrap()).unwrap());
    assert!((opposite - 4.0).abs() < 1e-5);
}

#[test]
fn test_uniformity_values() {
    init();
    let single = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
    assert_eq!(scalar(&uniformity(&single).unwrap()), 0.0);

    let orthonormal = Tensor::new(&[[1.0f32, 0.0], [0.0, 3.0]], &Device::Cpu).unwrap();
    assert!((scalar(&uniformity(&orthonormal).unwrap()) + 4.0).abs() < 1e-4);

    let u = scalar(&uniformity(&random_view(0)).unwrap());
    assert!(u <= 1e-6);
}

#[test]
fn test_alignment_uniformity_pair() {
    init();
    let e = engine();
    let x = random_view(0);
    let (align, uniform) = e.alignment_uniformity(&x, &x).unwrap();
    assert!(scalar(&align).abs() < 1e-5);
    let expected = scalar(&uniformity(&x).unwrap());
    assert!((scalar(&uniform) - expected).abs() < 1e-5);
}
