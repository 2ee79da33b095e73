//! Error types for hdcl.
//!
//! Fatal problems surface as [`HdclError`] and name the stage that raised them
//! (`"adjacency"`, `"similarity"`, `"cluster-init"`, ...). Degenerate inputs that
//! have a defined fallback (zero-degree nodes, empty head/tail partitions,
//! entities without similarity neighbours) are logged and never reach this type.

use thiserror::Error;

/// hdcl error type.
#[derive(Debug, Error)]
pub enum HdclError {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Missing or invalid option, or a metapath that cannot be resolved.
    #[error("[{component}] invalid configuration: {message}")]
    Configuration {
        component: &'static str,
        message: String,
    },

    /// Input values that cannot be normalised into finite weights.
    #[error("[{component}] degenerate input: {message}")]
    DegenerateInput {
        component: &'static str,
        message: String,
    },

    /// Declared node counts disagree with the data handed over.
    #[error("[{component}] shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        component: &'static str,
        expected: String,
        got: String,
    },

    /// k-means failed while building the cluster hierarchy.
    #[error("[cluster-init] k-means failed: {0}")]
    Clustering(String),

    /// Dataset file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset line could not be parsed.
    #[error("[dataset] line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl HdclError {
    pub(crate) fn config(component: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            component,
            message: message.into(),
        }
    }

    pub(crate) fn shape(
        component: &'static str,
        expected: impl ToString,
        got: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            component,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, HdclError>;
