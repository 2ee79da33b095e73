//! Learnable parameters with seeded initialisation.
//!
//! Candle's own initialisers draw from an unseeded source, so every table is
//! sampled here from a `ChaCha8Rng` and wrapped into a [`Var`]. The store keeps
//! the variables by name for the optimiser.

use candle_core::{Device, Tensor, Var};
use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{HdclError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// `N(0, sqrt(2 / (fan_in + fan_out)))`.
    XavierNormal,
    Zeros,
}

pub struct ParamStore {
    device: Device,
    rng: ChaCha8Rng,
    vars: Vec<(String, Var)>,
}

impl ParamStore {
    pub fn new(device: &Device, seed: u64) -> Self {
        Self {
            device: device.clone(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            vars: Vec::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Creates a `(rows, cols)` variable; `rows` is treated as fan-out.
    pub fn matrix(&mut self, name: &str, rows: usize, cols: usize, init: Init) -> Result<Var> {
        let fan = (rows + cols).max(1) as f64;
        let len = rows * cols;
        let values: Vec<f32> = match init {
            Init::XavierUniform => {
                let a = (6.0 / fan).sqrt();
                let dist = Uniform::new_inclusive(-a, a)
                    .map_err(|e| HdclError::config("params", e.to_string()))?;
                (0..len).map(|_| dist.sample(&mut self.rng) as f32).collect()
            }
            Init::XavierNormal => {
                let std = (2.0 / fan).sqrt();
                let dist = Normal::new(0.0, std)
                    .map_err(|e| HdclError::config("params", e.to_string()))?;
                (0..len).map(|_| dist.sample(&mut self.rng) as f32).collect()
            }
            Init::Zeros => vec![0.0; len],
        };
        let var = Var::from_tensor(&Tensor::from_vec(values, (rows, cols), &self.device)?)?;
        debug!("param {} {:?} ({:?})", name, (rows, cols), init);
        self.vars.push((name.to_string(), var.clone()));
        Ok(var)
    }

    /// Zero-initialised 1-D variable (biases).
    pub fn vector(&mut self, name: &str, len: usize) -> Result<Var> {
        let var = Var::from_tensor(&Tensor::zeros(len, candle_core::DType::F32, &self.device)?)?;
        self.vars.push((name.to_string(), var.clone()));
        Ok(var)
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(n, _)| n.as_str())
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.vars.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.vars.iter().map(|(_, v)| v.elem_count()).sum()
    }
}
