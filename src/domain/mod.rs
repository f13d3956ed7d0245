//! Core domain types for batch media loading.
//!
//! Pure value types with no I/O:
//! - Batch identity and completion summaries
//! - Photo-library asset handles and queries
//! - Decoded images and request options
//! - Snapshot-backed records (users, posts)

pub mod asset;
pub mod batch;
pub mod image;
pub mod record;

pub use asset::{AssetHandle, AssetId, AssetQuery, MediaType, SortDescriptor, SortKey};
pub use batch::{BatchId, BatchSummary};
pub use image::{ContentMode, DecodedImage, ImageRequestOptions, TargetSize};
pub use record::{FromSnapshot, Post, RecordPath, User};
