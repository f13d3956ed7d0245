//! Resolver adapters over the collaborator traits.
//!
//! Each adapter maps collaborator errors and malformed data to an absent
//! outcome, logging why, so the batch can complete without the item.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ImageDecoder, SnapshotSource};
use crate::domain::{AssetHandle, DecodedImage, FromSnapshot, ImageRequestOptions, Post, RecordPath, User};
use crate::resolver::Resolver;

/// Resolves photo-library assets into decoded images.
pub struct AssetImageResolver<D> {
    decoder: Arc<D>,
    options: ImageRequestOptions,
}

impl<D: ImageDecoder> AssetImageResolver<D> {
    pub fn new(decoder: Arc<D>, options: ImageRequestOptions) -> Self {
        Self { decoder, options }
    }

    pub fn options(&self) -> &ImageRequestOptions {
        &self.options
    }
}

#[async_trait]
impl<D: ImageDecoder + 'static> Resolver for AssetImageResolver<D> {
    type Handle = AssetHandle;
    type Item = DecodedImage;

    #[tracing::instrument(skip(self, asset), fields(asset_id = %asset.id))]
    async fn resolve(&self, asset: AssetHandle) -> Option<DecodedImage> {
        match self.decoder.request_image(&asset, &self.options).await {
            Ok(Some(image)) => Some(image),
            Ok(None) => {
                tracing::debug!("Asset has no decodable image, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode asset, skipping");
                None
            }
        }
    }
}

/// Reads one snapshot and maps it to `T`.
pub struct SnapshotResolver<S, T> {
    source: Arc<S>,
    _record: PhantomData<fn() -> T>,
}

impl<S: SnapshotSource, T: FromSnapshot> SnapshotResolver<S, T> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            _record: PhantomData,
        }
    }
}

/// Read a snapshot, logging and swallowing source errors.
async fn observe<S: SnapshotSource>(source: &S, path: &RecordPath) -> Option<serde_json::Value> {
    match source.observe_single(path).await {
        Ok(Some(value)) => Some(value),
        Ok(None) => {
            tracing::debug!(path = %path, "No snapshot stored at path");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Failed to read snapshot");
            None
        }
    }
}

#[async_trait]
impl<S, T> Resolver for SnapshotResolver<S, T>
where
    S: SnapshotSource + 'static,
    T: FromSnapshot + Send + 'static,
{
    type Handle = RecordPath;
    type Item = T;

    async fn resolve(&self, path: RecordPath) -> Option<T> {
        let value = observe(self.source.as_ref(), &path).await?;
        let record = T::from_snapshot(path.key(), &value);
        if record.is_none() {
            tracing::warn!(path = %path, "Malformed snapshot, skipping");
        }
        record
    }
}

/// Reference to one post snapshot together with its author.
#[derive(Debug, Clone, PartialEq)]
pub struct PostHandle {
    pub path: RecordPath,
    pub author: Arc<User>,
}

/// Resolves post snapshots into posts, including whether the viewer has
/// liked each one.
pub struct PostResolver<S> {
    source: Arc<S>,
    viewer_uid: Option<String>,
}

impl<S: SnapshotSource> PostResolver<S> {
    pub fn new(source: Arc<S>, viewer_uid: Option<String>) -> Self {
        Self { source, viewer_uid }
    }

    async fn has_liked(&self, post_id: &str, viewer_uid: &str) -> bool {
        let path = RecordPath::like(post_id, viewer_uid);
        match self.source.observe_single(&path).await {
            // Stored as 1, or 1.0 by clients that only write doubles
            Ok(Some(value)) => value.as_f64() == Some(1.0),
            Ok(None) => false,
            Err(e) => {
                // The post itself is still usable
                tracing::warn!(path = %path, error = %e, "Failed to read like state");
                false
            }
        }
    }
}

#[async_trait]
impl<S: SnapshotSource + 'static> Resolver for PostResolver<S> {
    type Handle = PostHandle;
    type Item = Post;

    async fn resolve(&self, handle: PostHandle) -> Option<Post> {
        let PostHandle { path, author } = handle;
        let value = observe(self.source.as_ref(), &path).await?;
        let Some(mut post) = Post::from_snapshot(path.key(), (*author).clone(), &value) else {
            tracing::warn!(path = %path, "Malformed post snapshot, skipping");
            return None;
        };

        if let Some(viewer_uid) = &self.viewer_uid {
            post.has_liked = self.has_liked(&post.id, viewer_uid).await;
        }
        Some(post)
    }
}
