use approx::assert_abs_diff_eq;
use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::HdclError;
use crate::hetero::{HeteroGraphBuilder, Metapath};
use crate::metapath::{MetapathEncoder, SemanticAttention};
use crate::params::{Init, ParamStore};
use crate::tests::init;
use crate::tests::test_helpers::{actor_edges, toy_graph};

fn item_encoder(params: &mut ParamStore, dropout: f64) -> MetapathEncoder {
    let attention = SemanticAttention::new(params, "item", 8, 4).unwrap();
    MetapathEncoder::new(
        "item",
        vec![Metapath::new(["iu", "ui"]), Metapath::new(["ia", "ai"])],
        attention,
        dropout,
    )
}

#[test]
fn test_reachable_graph_of_user_item_user() {
    init();
    let graph = toy_graph();
    let reach = Metapath::new(["ui", "iu"]).reachable(&graph).unwrap();
    assert_eq!((reach.rows(), reach.cols()), (4, 4));
    // u0 and u1 share item 1
    assert_eq!(reach.get(0, 1), Some(&1.0));
    assert_eq!(reach.get(0, 0), Some(&1.0));
    // u3 only interacted with item 4
    assert_eq!(reach.get(3, 0), None);
    assert_eq!(reach.get(3, 3), Some(&1.0));
}

#[test]
fn test_forward_shape_and_attention_weights() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 1);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let out = enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(out.dims(), &[5, 8]);

    let weights = enc.attention_weights(&graph, features.as_tensor()).unwrap();
    assert_eq!(weights.len(), 2);
    assert_abs_diff_eq!(weights.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    assert!(weights.iter().all(|&w| w > 0.0 && w < 1.0));
}

#[test]
fn test_stacked_metapath_embeddings() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 1);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);
    let z = enc.metapath_embeddings(&graph, features.as_tensor()).unwrap();
    assert_eq!(z.dims(), &[5, 2, 8]);
}

#[test]
fn test_cache_rebuilt_only_on_graph_change_or_invalidate() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 1);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    assert!(!enc.cache().is_valid_for(&graph));
    enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(enc.cache().builds(), 1);
    enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(enc.cache().builds(), 1);
    assert!(enc.cache().is_valid_for(&graph));

    enc.invalidate_cache();
    assert!(!enc.cache().is_valid_for(&graph));
    enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(enc.cache().builds(), 2);

    let other = HeteroGraphBuilder::new()
        .with_node_type("user", 4)
        .with_node_type("item", 5)
        .with_node_type("actor", 2)
        .with_symmetric_relation("ui", "iu", "user", "item", vec![(0, 0), (1, 1), (2, 2), (3, 4)])
        .with_symmetric_relation("ia", "ai", "item", "actor", actor_edges())
        .build()
        .unwrap();
    assert_ne!(other.token(), graph.token());
    enc.forward(&other, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(enc.cache().builds(), 3);
    assert!(enc.cache().is_valid_for(&other));
}

#[test]
fn test_eval_forward_is_deterministic_with_dropout_configured() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 1);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.5);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let a = enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    let b = enc.forward(&graph, features.as_tensor(), false, &mut rng).unwrap();
    assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    let c = enc.forward(&graph, features.as_tensor(), true, &mut rng).unwrap();
    assert_ne!(a.to_vec2::<f32>().unwrap(), c.to_vec2::<f32>().unwrap());
}

#[test]
fn test_feature_rows_must_match_node_count() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 1);
    let features = params.matrix("features.item", 4, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);
    let err = enc.metapath_embeddings(&graph, features.as_tensor()).unwrap_err();
    assert!(matches!(err, HdclError::ShapeMismatch { component: "metapath", .. }));
}

#[test]
fn test_invalid_metapaths_are_configuration_errors() {
    init();
    let graph = toy_graph();
    let undefined = Metapath::new(["ui", "zz"]).validate(&graph, "user").unwrap_err();
    assert!(matches!(undefined, HdclError::Configuration { component: "metapath", .. }));

    let open_ended = Metapath::new(["ui"]).validate(&graph, "user").unwrap_err();
    assert!(matches!(open_ended, HdclError::Configuration { .. }));

    let wrong_start = Metapath::new(["iu", "ui"]).validate(&graph, "user").unwrap_err();
    assert!(matches!(wrong_start, HdclError::Configuration { .. }));

    let empty = Metapath::new(Vec::<String>::new()).validate(&graph, "user").unwrap_err();
    assert!(matches!(empty, HdclError::Configuration { .. }));

    assert!(Metapath::new(["ui", "iu"]).validate(&graph, "user").is_ok());
    assert!(Metapath::new(["ia", "ai"]).validate(&graph, "item").is_ok());
}

#[test]
fn test_relation_without_reverse_is_rejected() {
    init();
    let graph = HeteroGraphBuilder::new()
        .with_node_type("user", 2)
        .with_node_type("item", 2)
        .with_relation("ui", "user", "item", vec![(0, 0), (1, 1)])
        .with_relation("iu", "item", "user", vec![(0, 1)])
        .build()
        .unwrap();
    let err = Metapath::new(["ui", "iu"]).validate(&graph, "user").unwrap_err();
    assert!(matches!(err, HdclError::Configuration { .. }));
}

#[test]
fn test_actor_metapath_averages_items_sharing_an_actor() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 4);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);

    // ia/ai: items {0, 1} share actor 0, items {2, 3, 4} share actor 1, so every
    // reachable block is complete and D_in^-1/2 A^T D_out^-1/2 is a block mean.
    let z = enc.metapath_embeddings(&graph, features.as_tensor()).unwrap();
    let actor_path = z.narrow(1, 1, 1).unwrap().squeeze(1).unwrap().to_vec2::<f32>().unwrap();
    let h = features.as_tensor().to_vec2::<f32>().unwrap();
    let block_mean = |ids: &[usize], col: usize| ids.iter().map(|&i| h[i][col]).sum::<f32>() / ids.len() as f32;
    let pair: &[usize] = &[0, 1];
    let triple: &[usize] = &[2, 3, 4];
    for (node, block) in [(0, pair), (1, pair), (2, triple), (3, triple), (4, triple)] {
        for col in 0..8 {
            assert_abs_diff_eq!(actor_path[node][col], block_mean(block, col), epsilon = 1e-5);
        }
    }
}

#[test]
fn test_forward_is_attention_weighted_sum_of_metapaths() {
    init();
    let graph = toy_graph();
    let mut params = ParamStore::new(&Device::Cpu, 6);
    let features = params.matrix("features.item", 5, 8, Init::XavierUniform).unwrap();
    let mut enc = item_encoder(&mut params, 0.0);
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let z = enc.metapath_embeddings(&graph, features.as_tensor()).unwrap();
    let weights = enc.attention_weights(&graph, features.as_tensor()).unwrap();
    let out = enc
        .forward(&graph, features.as_tensor(), false, &mut rng)
        .unwrap()
        .to_vec2::<f32>()
        .unwrap();

    let z = z.to_vec3::<f32>().unwrap();
    for (node, row) in out.iter().enumerate() {
        for (col, &v) in row.iter().enumerate() {
            let expected: f32 = weights.iter().enumerate().map(|(m, w)| w * z[node][m][col]).sum();
            assert_abs_diff_eq!(v, expected, epsilon = 1e-5);
        }
    }
}
