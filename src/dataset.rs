//! Interaction splits, side-relation edge files and BPR batch sampling.
//!
//! Split files hold one user per line, `user item item ...`, whitespace
//! separated. Relation files hold one edge per line, `src<TAB>dst`, extra
//! columns ignored. Blank lines are skipped everywhere.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, info, trace};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::HdclConfig;
use crate::error::{HdclError, Result};
use crate::hetero::{HeteroGraph, HeteroGraphBuilder};

/// User -> observed items.
pub type UserItems = BTreeMap<u32, Vec<u32>>;

fn parse_id(token: &str, line: usize) -> Result<u32> {
    token.parse::<u32>().map_err(|e| HdclError::Parse {
        line,
        message: format!("'{}': {}", token, e),
    })
}

/// Parses `user item item ...` lines; repeated users are merged.
pub fn parse_interactions<R: BufRead>(reader: R) -> Result<UserItems> {
    let mut out: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };
        let user = parse_id(first, n + 1)?;
        let items = out.entry(user).or_default();
        for t in tokens {
            items.insert(parse_id(t, n + 1)?);
        }
    }
    Ok(out
        .into_iter()
        .map(|(u, items)| (u, items.into_iter().collect()))
        .collect())
}

/// Parses `src<TAB>dst` edge lines.
pub fn parse_edges<R: BufRead>(reader: R) -> Result<Vec<(u32, u32)>> {
    let mut edges = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split('\t').map(str::trim).filter(|t| !t.is_empty());
        let Some(src) = tokens.next() else {
            continue;
        };
        let dst = tokens.next().ok_or_else(|| HdclError::Parse {
            line: n + 1,
            message: "expected 'src<TAB>dst'".into(),
        })?;
        edges.push((parse_id(src, n + 1)?, parse_id(dst, n + 1)?));
    }
    Ok(edges)
}

pub fn read_interactions(path: impl AsRef<Path>) -> Result<UserItems> {
    let path = path.as_ref();
    debug!("Reading interactions from {}", path.display());
    parse_interactions(BufReader::new(File::open(path)?))
}

pub fn read_edges(path: impl AsRef<Path>) -> Result<Vec<(u32, u32)>> {
    let path = path.as_ref();
    debug!("Reading edges from {}", path.display());
    parse_edges(BufReader::new(File::open(path)?))
}

/// A side relation added to the graph together with its reverse.
#[derive(Debug, Clone)]
pub struct SideRelation {
    pub name: String,
    pub reverse: String,
    pub src_type: String,
    pub dst_type: String,
    pub edges: Vec<(u32, u32)>,
}

impl SideRelation {
    pub fn new(
        name: impl Into<String>,
        reverse: impl Into<String>,
        src_type: impl Into<String>,
        dst_type: impl Into<String>,
        edges: Vec<(u32, u32)>,
    ) -> Self {
        Self {
            name: name.into(),
            reverse: reverse.into(),
            src_type: src_type.into(),
            dst_type: dst_type.into(),
            edges,
        }
    }
}

/// Train/test interaction split with entity counts.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: UserItems,
    pub test: UserItems,
    pub n_users: usize,
    pub n_items: usize,
}

impl Dataset {
    /// Counts are `max id + 1` over both splits.
    pub fn from_splits(train: UserItems, test: UserItems) -> Self {
        let max_user = train.keys().chain(test.keys()).max().map_or(0, |&u| u as usize + 1);
        let max_item = train
            .values()
            .chain(test.values())
            .flat_map(|items| items.iter())
            .max()
            .map_or(0, |&i| i as usize + 1);
        info!(
            "Dataset: {} users, {} items, {} train / {} test interactions",
            max_user,
            max_item,
            train.values().map(Vec::len).sum::<usize>(),
            test.values().map(Vec::len).sum::<usize>()
        );
        Self {
            train,
            test,
            n_users: max_user,
            n_items: max_item,
        }
    }

    /// Reads `train.txt` and `test.txt` from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let train = read_interactions(dir.join("train.txt"))?;
        let test = read_interactions(dir.join("test.txt"))?;
        Ok(Self::from_splits(train, test))
    }

    pub fn train_pairs(&self) -> Vec<(u32, u32)> {
        self.train
            .iter()
            .flat_map(|(&u, items)| items.iter().map(move |&i| (u, i)))
            .collect()
    }

    pub fn num_train(&self) -> usize {
        self.train.values().map(Vec::len).sum()
    }

    /// Heterogeneous graph of the training interactions plus side relations.
    ///
    /// The interaction relation is named by `config.ui_relation` and its reverse
    /// by `ui_reverse`. Every node type is sized by the largest id seen in any
    /// relation; user and item counts grown by side relations are written back
    /// to `n_users`/`n_items`.
    pub fn graph(&mut self, config: &HdclConfig, ui_reverse: &str, side: Vec<SideRelation>) -> Result<HeteroGraph> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        counts.insert(config.user_key.clone(), self.n_users);
        counts.insert(config.item_key.clone(), self.n_items);
        for rel in &side {
            for (ntype, ids) in [
                (&rel.src_type, rel.edges.iter().map(|e| e.0).max()),
                (&rel.dst_type, rel.edges.iter().map(|e| e.1).max()),
            ] {
                let needed = ids.map_or(0, |m| m as usize + 1);
                let entry = counts.entry(ntype.clone()).or_insert(0);
                *entry = (*entry).max(needed);
            }
        }
        for (key, count) in [(&config.user_key, &mut self.n_users), (&config.item_key, &mut self.n_items)] {
            let sized = counts.get(key).copied().unwrap_or(*count);
            if sized > *count {
                info!("'{}' count grown from {} to {} by side relations", key, *count, sized);
                *count = sized;
            }
        }

        let mut builder = HeteroGraphBuilder::new();
        for (ntype, n) in &counts {
            trace!("node type {}: {}", ntype, n);
            builder = builder.with_node_type(ntype.clone(), *n);
        }
        builder = builder.with_symmetric_relation(
            config.ui_relation.clone(),
            ui_reverse,
            config.user_key.clone(),
            config.item_key.clone(),
            self.train_pairs(),
        );
        for rel in side {
            builder = if rel.name == rel.reverse {
                builder.with_relation(rel.name, rel.src_type, rel.dst_type, rel.edges)
            } else {
                builder.with_symmetric_relation(rel.name, rel.reverse, rel.src_type, rel.dst_type, rel.edges)
            };
        }
        builder.build()
    }
}

/// One batch of `(user, positive, negative)` triples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BprBatch {
    pub users: Vec<u32>,
    pub pos: Vec<u32>,
    pub neg: Vec<u32>,
}

impl BprBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Seeded BPR sampler: shuffles training pairs, draws unobserved negatives.
pub struct BprSampler {
    pairs: Vec<(u32, u32)>,
    observed: BTreeMap<u32, HashSet<u32>>,
    n_items: usize,
    rng: ChaCha8Rng,
}

impl BprSampler {
    pub fn new(dataset: &Dataset, seed: u64) -> Result<Self> {
        let observed: BTreeMap<u32, HashSet<u32>> = dataset
            .train
            .iter()
            .map(|(&u, items)| (u, items.iter().copied().collect()))
            .collect();
        if let Some((u, _)) = observed.iter().find(|(_, items)| items.len() >= dataset.n_items) {
            return Err(HdclError::DegenerateInput {
                component: "dataset",
                message: format!("user {} has interacted with every item, no negative exists", u),
            });
        }
        Ok(Self {
            pairs: dataset.train_pairs(),
            observed,
            n_items: dataset.n_items,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    fn negative_for(&mut self, user: u32) -> u32 {
        loop {
            let cand = self.rng.random_range(0..self.n_items) as u32;
            if !self.observed.get(&user).is_some_and(|seen| seen.contains(&cand)) {
                return cand;
            }
        }
    }

    /// One epoch of shuffled batches; the last one may be shorter.
    pub fn epoch(&mut self, batch_size: usize) -> Vec<BprBatch> {
        let mut pairs = std::mem::take(&mut self.pairs);
        pairs.shuffle(&mut self.rng);
        let batches: Vec<BprBatch> = pairs
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let mut batch = BprBatch::default();
                for &(u, i) in chunk {
                    batch.users.push(u);
                    batch.pos.push(i);
                    batch.neg.push(self.negative_for(u));
                }
                batch
            })
            .collect();
        self.pairs = pairs;
        debug!("BPR epoch: {} batches of <= {}", batches.len(), batch_size);
        batches
    }
}
