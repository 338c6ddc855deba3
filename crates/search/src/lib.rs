//! Nearest-neighbour product search over the catalog vector store.
//!
//! Uses the store's vector index when it exists and falls back to an
//! exhaustive cosine scan when it does not.

mod engine;
mod error;

pub use engine::{
    validate_request, QueryEngine, SearchConfig, SearchOutcome, SearchPath, MAX_K, MIN_K,
};
pub use error::{Result, SearchError};
