//! Training loop and offline ranking evaluation.
//!
//! Each step minimises `loss + emb_reg · reg_loss` from
//! [`HdclModel::ranking_loss`] with AdamW. Evaluation ranks every item for each
//! test user, masks the user's training items and reports Recall@K and NDCG@K
//! averaged over users with at least one test item.

use std::collections::HashSet;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::dataset::{BprSampler, Dataset};
use crate::error::{HdclError, Result};
use crate::model::HdclModel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Cut-off of the ranking metrics.
    pub top_k: usize,
    pub eval_batch_size: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 2048,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            top_k: 20,
            eval_batch_size: 256,
        }
    }
}

/// Mean losses of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub bpr: f64,
    pub ssl: f64,
    pub car: f64,
    pub reg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankingMetrics {
    pub k: usize,
    pub recall: f64,
    pub ndcg: f64,
    /// Users with at least one test item.
    pub users: usize,
}

/// Fraction of `relevant` found in the first `k` of `ranked`.
pub fn recall_at_k(ranked: &[u32], relevant: &HashSet<u32>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    let hits = ranked.iter().take(k).filter(|i| relevant.contains(i)).count();
    hits as f64 / relevant.len() as f64
}

/// Binary-relevance NDCG over the first `k` of `ranked`.
pub fn ndcg_at_k(ranked: &[u32], relevant: &HashSet<u32>, k: usize) -> f64 {
    let dcg: f64 = ranked
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, i)| relevant.contains(i))
        .map(|(pos, _)| 1.0 / (pos as f64 + 2.0).log2())
        .sum();
    let ideal: f64 = (0..relevant.len().min(k))
        .map(|pos| 1.0 / (pos as f64 + 2.0).log2())
        .sum();
    if ideal == 0.0 {
        0.0
    } else {
        dcg / ideal
    }
}

/// Indices of the `k` largest finite scores, descending, ties by index.
pub fn top_k_items(scores: &[f32], k: usize) -> Vec<u32> {
    let mut idx: Vec<usize> = (0..scores.len()).filter(|&i| scores[i].is_finite()).collect();
    idx.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(&b))
    });
    idx.truncate(k);
    idx.into_iter().map(|i| i as u32).collect()
}

pub struct Trainer {
    model: HdclModel,
    optimizer: AdamW,
    sampler: BprSampler,
    settings: TrainerConfig,
    epoch: usize,
}

impl Trainer {
    pub fn new(model: HdclModel, dataset: &Dataset, settings: TrainerConfig) -> Result<Self> {
        if settings.batch_size == 0 || settings.eval_batch_size == 0 || settings.top_k == 0 {
            return Err(HdclError::config(
                "training",
                "batch_size, eval_batch_size and top_k must be >= 1",
            ));
        }
        if dataset.n_users != model.n_users() || dataset.n_items != model.n_items() {
            return Err(HdclError::shape(
                "training",
                format!("{} users x {} items", model.n_users(), model.n_items()),
                format!("{} x {}", dataset.n_users, dataset.n_items),
            ));
        }
        let optimizer = AdamW::new(
            model.all_vars(),
            ParamsAdamW {
                lr: settings.learning_rate,
                weight_decay: settings.weight_decay,
                ..Default::default()
            },
        )?;
        let sampler = BprSampler::new(dataset, model.config().seed)?;
        info!(
            "Trainer: {} training pairs, batch {}, lr {}",
            sampler.num_pairs(),
            settings.batch_size,
            settings.learning_rate
        );
        Ok(Self {
            model,
            optimizer,
            sampler,
            settings,
            epoch: 0,
        })
    }

    pub fn model(&self) -> &HdclModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut HdclModel {
        &mut self.model
    }

    pub fn into_model(self) -> HdclModel {
        self.model
    }

    pub fn train_epoch(&mut self) -> Result<EpochStats> {
        self.model.train(true);
        let emb_reg = self.model.config().emb_reg;
        let batches = self.sampler.epoch(self.settings.batch_size);
        let mut sums = [0.0f64; 5];
        for batch in &batches {
            let out = self.model.ranking_loss(&batch.users, &batch.pos, &batch.neg)?;
            let total = out.loss.add(&out.reg_loss.affine(emb_reg, 0.0)?)?;
            self.optimizer.backward_step(&total)?;
            for (slot, t) in sums
                .iter_mut()
                .zip([&total, &out.bpr_loss, &out.ssl_loss, &out.car_loss, &out.reg_loss])
            {
                *slot += t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            }
        }
        let n = batches.len().max(1) as f64;
        let stats = EpochStats {
            epoch: self.epoch,
            loss: sums[0] / n,
            bpr: sums[1] / n,
            ssl: sums[2] / n,
            car: sums[3] / n,
            reg: sums[4] / n,
        };
        info!(
            "epoch {}: loss {:.5} (bpr {:.5}, ssl {:.5}, car {:.5}, reg {:.5})",
            stats.epoch, stats.loss, stats.bpr, stats.ssl, stats.car, stats.reg
        );
        self.epoch += 1;
        Ok(stats)
    }

    pub fn fit(&mut self) -> Result<Vec<EpochStats>> {
        (0..self.settings.epochs).map(|_| self.train_epoch()).collect()
    }

    /// Recall@K and NDCG@K over the test split, training items masked.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<RankingMetrics> {
        let k = self.settings.top_k;
        let was_training = self.model.is_training();
        self.model.train(false);

        let users: Vec<u32> = dataset
            .test
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(&u, _)| u)
            .collect();
        let (mut recall, mut ndcg) = (0.0, 0.0);
        for chunk in users.chunks(self.settings.eval_batch_size) {
            let scores = self.model.rate_all_items(chunk)?.to_vec2::<f32>()?;
            for (&u, mut row) in chunk.iter().zip(scores) {
                if let Some(seen) = dataset.train.get(&u) {
                    for &i in seen {
                        if let Some(s) = row.get_mut(i as usize) {
                            *s = f32::NEG_INFINITY;
                        }
                    }
                }
                let ranked = top_k_items(&row, k);
                let relevant: HashSet<u32> = dataset.test[&u].iter().copied().collect();
                recall += recall_at_k(&ranked, &relevant, k);
                ndcg += ndcg_at_k(&ranked, &relevant, k);
            }
            debug!("evaluated {} users", chunk.len());
        }
        self.model.train(was_training);

        let n = users.len().max(1) as f64;
        let metrics = RankingMetrics {
            k,
            recall: recall / n,
            ndcg: ndcg / n,
            users: users.len(),
        };
        info!(
            "Recall@{} {:.5}, NDCG@{} {:.5} over {} users",
            k, metrics.recall, k, metrics.ndcg, metrics.users
        );
        Ok(metrics)
    }
}
