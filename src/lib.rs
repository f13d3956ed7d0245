//! Ordered, fire-once batch loading of media items from asynchronous sources.
//!
//! A [`BatchLoader`] takes an ordered list of handles, resolves each one
//! concurrently through a [`Resolver`], and hands the successfully resolved
//! items to a completion callback exactly once, in input order. Handles whose
//! resolution fails are left out rather than failing the batch.
//!
//! Two loading paths are built on top of it:
//! - [`PhotoSelector`]: query the device photo library and decode the most
//!   recent images at display size
//! - [`ProfileFeed`]: read users and their posts (with the viewer's like
//!   state) from a remote key-value snapshot store

pub mod batch;
pub mod domain;
pub mod error;
pub mod feed;
pub mod loader;
pub mod metrics;
pub mod photos;
pub mod resolver;
pub mod source;

// Re-export commonly used types
pub use batch::*;
pub use domain::{
    AssetHandle, AssetId, AssetQuery, ContentMode, DecodedImage, FromSnapshot, ImageRequestOptions, MediaType, Post,
    RecordPath, SortDescriptor, SortKey, TargetSize, User,
};
pub use error::{MediaBatchError, Result};
pub use feed::{ProfileFeed, ProfileFeedConfig};
pub use loader::{BatchHandle, BatchLoader, LoaderConfig, LoaderStats};
#[cfg(feature = "metrics")]
pub use metrics::LoaderMetrics;
pub use photos::{PhotoSelector, PhotoSelectorConfig};
pub use resolver::{FnResolver, MockResolver, Resolver};
pub use source::{
    AssetImageResolver, AssetSource, ImageDecoder, InMemoryAssetSource, InMemoryImageDecoder, InMemorySnapshotSource,
    PostHandle, PostResolver, SnapshotResolver, SnapshotSource,
};
