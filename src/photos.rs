//! Camera-roll loading: query the photo library, then decode the matching
//! assets as one batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{AssetQuery, DecodedImage, ImageRequestOptions};
use crate::error::Result;
use crate::loader::{BatchHandle, BatchLoader, LoaderConfig};
use crate::source::{AssetImageResolver, AssetSource, ImageDecoder};

/// Configuration for a photo selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSelectorConfig {
    /// Which assets to load and in what order
    pub query: AssetQuery,
    /// Size and scaling of each decoded image
    pub image_options: ImageRequestOptions,
    pub loader: LoaderConfig,
}

impl Default for PhotoSelectorConfig {
    fn default() -> Self {
        Self {
            query: AssetQuery::default(),
            image_options: ImageRequestOptions::default(),
            loader: LoaderConfig::named("photos"),
        }
    }
}

/// Loads the most recent library photos as decoded images.
pub struct PhotoSelector<A, D: ImageDecoder + 'static> {
    assets: Arc<A>,
    query: AssetQuery,
    loader: BatchLoader<AssetImageResolver<D>>,
}

impl<A, D> PhotoSelector<A, D>
where
    A: AssetSource,
    D: ImageDecoder + 'static,
{
    pub fn new(assets: Arc<A>, decoder: Arc<D>, config: PhotoSelectorConfig) -> Result<Self> {
        let resolver = AssetImageResolver::new(decoder, config.image_options);
        Ok(Self {
            assets,
            query: config.query,
            loader: BatchLoader::new(Arc::new(resolver), config.loader)?,
        })
    }

    pub fn loader(&self) -> &BatchLoader<AssetImageResolver<D>> {
        &self.loader
    }

    /// Fetch the library assets and start decoding them.
    ///
    /// `on_complete` runs once with the decoded images in query order; assets
    /// that fail to decode are left out.
    ///
    /// The assets go out as a single batch, so a query returning more than
    /// `max_batch_size` assets (for example `limit: 0` on a large library) is
    /// rejected. [`PhotoSelector::load_photos`] has no such limit.
    ///
    /// # Errors
    /// Returns an error if the asset query fails or the batch is rejected by
    /// the loader. Nothing is decoded in that case.
    #[tracing::instrument(skip_all, fields(limit = self.query.limit))]
    pub async fn fetch_photos<F>(&self, on_complete: F) -> Result<BatchHandle>
    where
        F: FnOnce(Vec<DecodedImage>) + Send + 'static,
    {
        let assets = self.assets.fetch_assets(&self.query).await?;
        tracing::debug!(count = assets.len(), "Fetched library assets");
        self.loader.load_batch(assets, on_complete)
    }

    /// Fetch and decode the library assets, waiting for every one of them.
    ///
    /// Queries returning more than `max_batch_size` assets are decoded in
    /// several batches; the result keeps query order.
    #[tracing::instrument(skip_all, fields(limit = self.query.limit))]
    pub async fn load_photos(&self) -> Result<Vec<DecodedImage>> {
        let assets = self.assets.fetch_assets(&self.query).await?;
        tracing::debug!(count = assets.len(), "Fetched library assets");
        self.loader.load_chunked(assets).await
    }
}
