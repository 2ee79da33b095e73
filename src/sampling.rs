//! Neighbour sampling strategies for the contrastive positive pairs.
//!
//! A sampler picks one entry from a similarity neighbour list using an injected
//! random source, so callers control reproducibility through the rng they pass.

use log::trace;
use rand::{Rng, RngCore};

pub trait NeighborSampler: Send + Sync {
    /// Picks one `(neighbor, weight)` from parallel slices; `None` when empty.
    fn sample(&self, neighbors: &[u32], weights: &[f32], rng: &mut dyn RngCore)
        -> Option<(u32, f32)>;
}

/// Draws a neighbour with probability proportional to its similarity weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbabilisticSampler;

impl NeighborSampler for ProbabilisticSampler {
    fn sample(
        &self,
        neighbors: &[u32],
        weights: &[f32],
        rng: &mut dyn RngCore,
    ) -> Option<(u32, f32)> {
        match neighbors.len() {
            0 => None,
            // single candidate, no draw
            1 => Some((neighbors[0], weights[0])),
            _ => {
                let total: f64 = weights.iter().map(|&w| w.max(0.0) as f64).sum();
                if total <= 0.0 || !total.is_finite() {
                    return UniformSampler.sample(neighbors, weights, rng);
                }
                let target = rng.random::<f64>() * total;
                let mut acc = 0.0f64;
                let mut picked = neighbors.len() - 1;
                for (idx, &w) in weights.iter().enumerate() {
                    acc += w.max(0.0) as f64;
                    if target < acc {
                        picked = idx;
                        break;
                    }
                }
                trace!("weighted draw {:.4}/{:.4} -> slot {}", target, total, picked);
                Some((neighbors[picked], weights[picked]))
            }
        }
    }
}

/// Draws a neighbour uniformly, ignoring weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformSampler;

impl NeighborSampler for UniformSampler {
    fn sample(
        &self,
        neighbors: &[u32],
        weights: &[f32],
        rng: &mut dyn RngCore,
    ) -> Option<(u32, f32)> {
        match neighbors.len() {
            0 => None,
            1 => Some((neighbors[0], weights[0])),
            n => {
                let idx = rng.random_range(0..n);
                Some((neighbors[idx], weights[idx]))
            }
        }
    }
}
