//! Error types for the mapping engine

use grcmap_query::{AdvancedSearchError, QueryParseError};
use std::sync::Arc;
use thiserror::Error;

/// Registry-build errors. These are fatal: a registry that fails to build is
/// never handed out half-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`{model}` mixes in unknown entry `{mixin}`")]
    UnknownMixin { model: String, mixin: String },

    #[error("cyclic mixin chain: {}", chain.join(" -> "))]
    CyclicMixin { chain: Vec<String> },

    #[error("mapping `{model}.{mapping}` refers to unknown mapping `{source_name}`")]
    UnknownSource {
        model: String,
        mapping: String,
        source_name: String,
    },

    #[error("mappings of `{model}` refer to each other in a cycle: {}", chain.join(" -> "))]
    CyclicSource { model: String, chain: Vec<String> },

    #[error("entry `{0}` is declared twice")]
    DuplicateType(String),
}

/// Failure of a refresh or attach.
///
/// `Clone` so that one failed load can be handed to every caller that
/// coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("backend request failed: {0}")]
    Backend(Arc<anyhow::Error>),

    #[error("no mapping `{name}` is configured for `{model}`")]
    UnknownMapping { model: String, name: String },

    #[error("mapping context is no longer alive")]
    ContextDropped,

    #[error("{loader} bindings keep themselves current on a tokio runtime, and none is running")]
    NoRuntime { loader: &'static str },
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(Arc::new(err))
    }
}

impl LoadError {
    /// The original backend error, if this is a backend failure.
    pub fn backend_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Errors from the object-mapper search helper.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error(transparent)]
    Filter(#[from] QueryParseError),

    #[error(transparent)]
    AdvancedSearch(#[from] AdvancedSearchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("query service returned {got} responses for {expected} requests")]
    ResponseMismatch { expected: usize, got: usize },
}
