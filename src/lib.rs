//! # hdcl
//!
//! Heterogeneous-graph recommendation with dual contrastive learning and
//! hierarchical cluster-anchor regularization.
//!
//! The model combines
//! - LightGCN-style propagation over the normalised user-item graph, run on a
//!   clean table and on two sign-preserving perturbed views ([`propagation`]);
//! - metapath aggregation with semantic attention per node type ([`metapath`]);
//! - a structured cross-view contrastive loss with similarity-neighbour
//!   positives, plus alignment/uniformity terms ([`contrastive`], [`similarity`]);
//! - a multi-level cluster-anchor regularizer that treats head and tail
//!   entities asymmetrically ([`clustering`]).
//!
//! ```no_run
//! use hdcl::builder::HdclBuilder;
//! use hdcl::dataset::{Dataset, SideRelation};
//! use hdcl::hetero::Metapath;
//! use hdcl::training::{Trainer, TrainerConfig};
//! use hdcl::config::HdclConfig;
//!
//! # fn main() -> hdcl::error::Result<()> {
//! let mut dataset = Dataset::load("data/DoubanMovie")?;
//! let config = HdclConfig::default()
//!     .with_metapaths("user", vec![Metapath::new(["ui", "iu"])])
//!     .with_metapaths("item", vec![Metapath::new(["iu", "ui"])]);
//! let side = vec![SideRelation::new("ma", "am", "item", "actor", hdcl::dataset::read_edges("data/DoubanMovie/movie_actor.dat")?)];
//! let graph = dataset.graph(&config, "iu", side)?;
//!
//! let model = HdclBuilder::new().with_config(config).build(graph)?;
//! let mut trainer = Trainer::new(model, &dataset, TrainerConfig::default())?;
//! trainer.fit()?;
//! let metrics = trainer.evaluate(&dataset)?;
//! println!("recall {:.4} ndcg {:.4}", metrics.recall, metrics.ndcg);
//! # Ok(())
//! # }
//! ```

pub mod adjacency;
pub mod builder;
pub mod clustering;
pub mod config;
pub mod contrastive;
pub mod dataset;
pub mod error;
pub mod hetero;
pub mod metapath;
pub mod model;
pub mod params;
pub mod propagation;
pub mod sampling;
pub mod similarity;
pub mod training;

#[cfg(test)]
mod tests;
