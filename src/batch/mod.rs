//! Batch identity types.
//!
//! This module re-exports types from `domain::batch`.
//! See that module for the actual implementations.

pub use crate::domain::batch::{BatchId, BatchSummary};
