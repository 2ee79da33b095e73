//! Heterogeneous graph: typed node collections and typed directed relations.
//!
//! The graph is assembled once through [`HeteroGraphBuilder`] and is immutable
//! afterwards. Every relation stores `(src, dst)` pairs local to its endpoint
//! types. A content [`GraphToken`] is computed at build time so that derived
//! structures (metapath-reachable graphs) can be cached against it.
//!
//! ```
//! use hdcl::hetero::HeteroGraphBuilder;
//!
//! let g = HeteroGraphBuilder::new()
//!     .with_node_type("user", 2)
//!     .with_node_type("item", 3)
//!     .with_symmetric_relation("ui", "iu", "user", "item", vec![(0, 1), (1, 2)])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(g.num_nodes("item"), Some(3));
//! assert!(g.reverse_of("ui").is_some());
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::error::{HdclError, Result};

/// Content identity of a [`HeteroGraph`].
///
/// Derived with `DefaultHasher`, whose output may change between Rust
/// releases: compare tokens within one process, never persist them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphToken(u64);

/// A typed directed relation stored as COO pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub src_type: String,
    pub dst_type: String,
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
}

impl Relation {
    pub fn num_edges(&self) -> usize {
        self.src.len()
    }

    /// Sparse `n_src x n_dst` matrix of the relation; duplicate pairs are summed.
    pub fn to_csr(&self, n_src: usize, n_dst: usize) -> CsMat<f32> {
        let mut tri = TriMat::with_capacity((n_src, n_dst), self.num_edges());
        for (&s, &d) in self.src.iter().zip(&self.dst) {
            tri.add_triplet(s as usize, d as usize, 1.0f32);
        }
        tri.to_csr()
    }

    fn sorted_pairs(&self, transposed: bool) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = if transposed {
            self.dst.iter().copied().zip(self.src.iter().copied()).collect()
        } else {
            self.src.iter().copied().zip(self.dst.iter().copied()).collect()
        };
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }
}

/// Immutable heterogeneous graph.
#[derive(Debug, Clone)]
pub struct HeteroGraph {
    node_counts: BTreeMap<String, usize>,
    relations: BTreeMap<String, Relation>,
    token: GraphToken,
}

impl HeteroGraph {
    pub fn num_nodes(&self, ntype: &str) -> Option<usize> {
        self.node_counts.get(ntype).copied()
    }

    pub fn node_types(&self) -> impl Iterator<Item = (&str, usize)> {
        self.node_counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn token(&self) -> GraphToken {
        self.token
    }

    /// Finds a relation whose edge set is exactly the transpose of `name`.
    pub fn reverse_of(&self, name: &str) -> Option<&Relation> {
        let rel = self.relations.get(name)?;
        let transposed = rel.sorted_pairs(true);
        self.relations.values().find(|cand| {
            cand.src_type == rel.dst_type
                && cand.dst_type == rel.src_type
                && cand.sorted_pairs(false) == transposed
        })
    }

    /// Relation matrix sized by the declared node counts of its endpoint types.
    pub fn relation_matrix(&self, name: &str) -> Result<CsMat<f32>> {
        let rel = self
            .relations
            .get(name)
            .ok_or_else(|| HdclError::config("graph", format!("unknown relation '{}'", name)))?;
        let n_src = self.count_of(&rel.src_type)?;
        let n_dst = self.count_of(&rel.dst_type)?;
        Ok(rel.to_csr(n_src, n_dst))
    }

    fn count_of(&self, ntype: &str) -> Result<usize> {
        self.num_nodes(ntype)
            .ok_or_else(|| HdclError::config("graph", format!("unknown node type '{}'", ntype)))
    }
}

/// Staged construction of a [`HeteroGraph`].
#[derive(Debug, Default)]
pub struct HeteroGraphBuilder {
    node_counts: BTreeMap<String, usize>,
    relations: BTreeMap<String, Relation>,
}

impl HeteroGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_type(mut self, name: impl Into<String>, count: usize) -> Self {
        self.node_counts.insert(name.into(), count);
        self
    }

    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        src_type: impl Into<String>,
        dst_type: impl Into<String>,
        edges: Vec<(u32, u32)>,
    ) -> Self {
        let name = name.into();
        let (src, dst) = edges.into_iter().unzip();
        self.relations.insert(
            name.clone(),
            Relation {
                name,
                src_type: src_type.into(),
                dst_type: dst_type.into(),
                src,
                dst,
            },
        );
        self
    }

    /// Adds `name: src_type -> dst_type` and its reverse `rev_name`.
    pub fn with_symmetric_relation(
        self,
        name: impl Into<String>,
        rev_name: impl Into<String>,
        src_type: impl Into<String>,
        dst_type: impl Into<String>,
        edges: Vec<(u32, u32)>,
    ) -> Self {
        let src_type = src_type.into();
        let dst_type = dst_type.into();
        let reversed: Vec<(u32, u32)> = edges.iter().map(|&(s, d)| (d, s)).collect();
        self.with_relation(name, src_type.clone(), dst_type.clone(), edges)
            .with_relation(rev_name, dst_type, src_type, reversed)
    }

    /// Checks endpoint types and id ranges, then freezes the graph.
    pub fn build(self) -> Result<HeteroGraph> {
        for rel in self.relations.values() {
            let n_src = *self.node_counts.get(&rel.src_type).ok_or_else(|| {
                HdclError::config(
                    "graph",
                    format!("relation '{}' uses unknown type '{}'", rel.name, rel.src_type),
                )
            })?;
            let n_dst = *self.node_counts.get(&rel.dst_type).ok_or_else(|| {
                HdclError::config(
                    "graph",
                    format!("relation '{}' uses unknown type '{}'", rel.name, rel.dst_type),
                )
            })?;
            if let Some(&bad) = rel.src.iter().find(|&&s| s as usize >= n_src) {
                return Err(HdclError::shape(
                    "graph",
                    format!("{} ids < {}", rel.src_type, n_src),
                    format!("id {} in relation '{}'", bad, rel.name),
                ));
            }
            if let Some(&bad) = rel.dst.iter().find(|&&d| d as usize >= n_dst) {
                return Err(HdclError::shape(
                    "graph",
                    format!("{} ids < {}", rel.dst_type, n_dst),
                    format!("id {} in relation '{}'", bad, rel.name),
                ));
            }
            trace!("relation {} ({} -> {}): {} edges", rel.name, rel.src_type, rel.dst_type, rel.num_edges());
        }

        let mut hasher = DefaultHasher::new();
        self.node_counts.hash(&mut hasher);
        for rel in self.relations.values() {
            rel.name.hash(&mut hasher);
            rel.src_type.hash(&mut hasher);
            rel.dst_type.hash(&mut hasher);
            rel.src.hash(&mut hasher);
            rel.dst.hash(&mut hasher);
        }
        let token = GraphToken(hasher.finish());

        info!(
            "Built heterogeneous graph: {} node types, {} relations",
            self.node_counts.len(),
            self.relations.len()
        );
        debug!("Graph token {:?}", token);

        Ok(HeteroGraph {
            node_counts: self.node_counts,
            relations: self.relations,
            token,
        })
    }
}

/// Ordered sequence of relation names, e.g. `["um", "mu"]` for user-movie-user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metapath(pub Vec<String>);

impl Metapath {
    pub fn new<S: Into<String>>(relations: impl IntoIterator<Item = S>) -> Self {
        Self(relations.into_iter().map(Into::into).collect())
    }

    pub fn relations(&self) -> &[String] {
        &self.0
    }

    /// Checks that the pattern starts and ends at `ntype`, chains type-consistently
    /// and only uses relations whose reverse is present.
    pub fn validate(&self, graph: &HeteroGraph, ntype: &str) -> Result<()> {
        if self.0.is_empty() {
            return Err(HdclError::config("metapath", format!("empty metapath for '{}'", ntype)));
        }
        let mut current = ntype.to_string();
        for name in &self.0 {
            let rel = graph.relation(name).ok_or_else(|| {
                HdclError::config(
                    "metapath",
                    format!("metapath {:?} references undefined relation '{}'", self.0, name),
                )
            })?;
            if rel.src_type != current {
                return Err(HdclError::config(
                    "metapath",
                    format!(
                        "metapath {:?}: relation '{}' starts at '{}' but path is at '{}'",
                        self.0, name, rel.src_type, current
                    ),
                ));
            }
            if graph.reverse_of(name).is_none() {
                return Err(HdclError::config(
                    "metapath",
                    format!("relation '{}' has no reverse relation in the graph", name),
                ));
            }
            current = rel.dst_type.clone();
        }
        if current != ntype {
            return Err(HdclError::config(
                "metapath",
                format!("metapath {:?} ends at '{}', expected '{}'", self.0, current, ntype),
            ));
        }
        Ok(())
    }

    /// Binary adjacency of endpoints connected by this exact relation sequence.
    pub fn reachable(&self, graph: &HeteroGraph) -> Result<CsMat<f32>> {
        let mut names = self.0.iter();
        let first = names
            .next()
            .ok_or_else(|| HdclError::config("metapath", "empty metapath"))?;
        let mut product = graph.relation_matrix(first)?.map(|_| 1.0f32);
        for name in names {
            let next = graph.relation_matrix(name)?;
            product = (&product * &next).map(|_| 1.0f32);
        }
        debug!(
            "Metapath {:?}: {}x{} reachable graph with {} edges",
            self.0,
            product.rows(),
            product.cols(),
            product.nnz()
        );
        Ok(product)
    }
}
