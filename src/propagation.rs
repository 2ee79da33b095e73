//! LightGCN-style propagation with two sign-preserving perturbed views.
//!
//! For `L` layers over the normalised adjacency `G`:
//!
//! ```text
//! g_l     = G · E_l
//! E_{l+1} = g_l + E_l            (residual accumulation)
//! E_final = sum_{l=0..L} E_l
//! ```
//!
//! The same recurrence runs on the clean base table and on two views
//! `E + U(0,1) ⊙ sign(E) · eps`, each with a fresh noise draw per call.

use candle_core::{Tensor, Var};
use log::{debug, trace};
use rand::{Rng, RngCore};

use crate::adjacency::{NormalizedAdjacency, SparseOperator};
use crate::error::{HdclError, Result};

/// Per-view outputs of one propagation pass.
#[derive(Debug, Clone)]
pub struct PropagationOutput {
    pub user_base: Tensor,
    pub item_base: Tensor,
    pub user_view1: Tensor,
    pub item_view1: Tensor,
    pub user_view2: Tensor,
    pub item_view2: Tensor,
    /// Raw `G · E_l` of the base view, one entry per layer.
    pub layer_outputs: Vec<Tensor>,
    /// Accumulated base embeddings `E_0 ..= E_L`.
    pub accumulated: Vec<Tensor>,
}

pub struct PropagationEncoder {
    operator: SparseOperator,
    base: Var,
    n_users: usize,
    n_items: usize,
    n_layers: usize,
    epsilon: f64,
}

impl PropagationEncoder {
    pub fn new(
        adjacency: &NormalizedAdjacency,
        base: Var,
        n_layers: usize,
        epsilon: f64,
    ) -> Result<Self> {
        let (rows, dim) = base.dims2()?;
        if rows != adjacency.n_nodes() {
            return Err(HdclError::shape(
                "propagation",
                format!("{} base rows (users + items)", adjacency.n_nodes()),
                rows,
            ));
        }
        debug!(
            "PropagationEncoder: {} nodes, dim {}, {} layers, eps {}",
            rows, dim, n_layers, epsilon
        );
        Ok(Self {
            operator: adjacency.to_operator(base.device())?,
            base,
            n_users: adjacency.n_users,
            n_items: adjacency.n_items,
            n_layers,
            epsilon,
        })
    }

    pub fn base(&self) -> &Var {
        &self.base
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// `U(0,1)` noise of the base table's shape, drawn from `rng`.
    pub fn draw_noise(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        let (rows, cols) = self.base.dims2()?;
        let values: Vec<f32> = (0..rows * cols).map(|_| rng.random::<f32>()).collect();
        Ok(Tensor::from_vec(values, (rows, cols), self.base.device())?)
    }

    /// `E + noise ⊙ sign(E) · eps`.
    pub fn perturb(&self, embeddings: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let delta = noise
            .mul(&embeddings.detach().sign()?)?
            .affine(self.epsilon, 0.0)?;
        Ok(embeddings.add(&delta)?)
    }

    fn propagate(&self, start: &Tensor) -> Result<(Tensor, Vec<Tensor>, Vec<Tensor>)> {
        let mut accumulated = vec![start.clone()];
        let mut raw = Vec::with_capacity(self.n_layers);
        for layer in 0..self.n_layers {
            let g = self.operator.matmul(&accumulated[layer])?;
            let next = g.add(&accumulated[layer])?;
            raw.push(g);
            accumulated.push(next);
        }
        let summed = Tensor::stack(&accumulated, 0)?.sum(0)?;
        Ok((summed, raw, accumulated))
    }

    fn split(&self, all: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((
            all.narrow(0, 0, self.n_users)?,
            all.narrow(0, self.n_users, self.n_items)?,
        ))
    }

    /// Clean view only, no noise drawn.
    pub fn forward_base(&self) -> Result<(Tensor, Tensor)> {
        let (all_base, _, _) = self.propagate(self.base.as_tensor())?;
        self.split(&all_base)
    }

    pub fn forward(&self, rng: &mut dyn RngCore) -> Result<PropagationOutput> {
        let base = self.base.as_tensor();
        let noise1 = self.draw_noise(rng)?;
        let noise2 = self.draw_noise(rng)?;
        let view1 = self.perturb(base, &noise1)?;
        let view2 = self.perturb(base, &noise2)?;

        let (all_base, layer_outputs, accumulated) = self.propagate(base)?;
        let (all_v1, _, _) = self.propagate(&view1)?;
        let (all_v2, _, _) = self.propagate(&view2)?;
        trace!("propagated {} layers over 3 views", self.n_layers);

        let (user_base, item_base) = self.split(&all_base)?;
        let (user_view1, item_view1) = self.split(&all_v1)?;
        let (user_view2, item_view2) = self.split(&all_v2)?;

        Ok(PropagationOutput {
            user_base,
            item_base,
            user_view1,
            item_view1,
            user_view2,
            item_view2,
            layer_outputs,
            accumulated,
        })
    }
}
