//! Collaborator interfaces the loader's resolvers are built on.
//!
//! These traits abstract the device photo library, the image decoder and the
//! remote key-value snapshot store, so the loading paths can run against
//! in-memory implementations in tests.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{AssetHandle, AssetQuery, DecodedImage, ImageRequestOptions, RecordPath};
use crate::error::Result;

pub mod memory;
pub mod resolvers;

pub use memory::{InMemoryAssetSource, InMemoryImageDecoder, InMemorySnapshotSource};
pub use resolvers::{AssetImageResolver, PostHandle, PostResolver, SnapshotResolver};

/// Source of photo-library assets.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Fetch assets matching `query`, sorted by its sort descriptor and
    /// truncated to its limit.
    async fn fetch_assets(&self, query: &AssetQuery) -> Result<Vec<AssetHandle>>;
}

/// Decoder producing display-ready images from assets.
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    /// Decode `asset` scaled into `options.target_size`.
    ///
    /// Returns `Ok(None)` when the asset has no decodable image data.
    async fn request_image(
        &self,
        asset: &AssetHandle,
        options: &ImageRequestOptions,
    ) -> Result<Option<DecodedImage>>;
}

/// Remote key-value store read as one-shot snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Read the value stored at `path` once.
    ///
    /// Returns `Ok(None)` when nothing is stored there.
    async fn observe_single(&self, path: &RecordPath) -> Result<Option<Value>>;
}
