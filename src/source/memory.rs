//! In-memory collaborator implementations.
//!
//! Used by tests and demos in place of a real photo library, decoder or
//! remote store. Each one can be told to fail for specific inputs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{AssetSource, ImageDecoder, SnapshotSource};
use crate::domain::{AssetHandle, AssetId, AssetQuery, DecodedImage, ImageRequestOptions, RecordPath};
use crate::error::Result;

/// Photo library held in memory.
#[derive(Default)]
pub struct InMemoryAssetSource {
    assets: RwLock<Vec<AssetHandle>>,
    unavailable: AtomicBool,
}

impl InMemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assets(assets: impl IntoIterator<Item = AssetHandle>) -> Self {
        Self {
            assets: RwLock::new(assets.into_iter().collect()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn add_asset(&self, asset: AssetHandle) {
        self.assets.write().push(asset);
    }

    /// Make every fetch fail, as if library access had been revoked.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AssetSource for InMemoryAssetSource {
    async fn fetch_assets(&self, query: &AssetQuery) -> Result<Vec<AssetHandle>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Photo library is unavailable").into());
        }
        Ok(query.apply(self.assets.read().iter()))
    }
}

/// Decoder serving registered image bytes at the requested fitted size.
#[derive(Default)]
pub struct InMemoryImageDecoder {
    images: RwLock<HashMap<AssetId, Vec<u8>>>,
    failing: RwLock<HashSet<AssetId>>,
    requests: AtomicUsize,
}

impl InMemoryImageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the encoded bytes for an asset.
    pub fn register(&self, asset_id: impl Into<AssetId>, data: Vec<u8>) {
        self.images.write().insert(asset_id.into(), data);
    }

    /// Make decoding `asset_id` return an error.
    pub fn fail_on(&self, asset_id: impl Into<AssetId>) {
        self.failing.write().insert(asset_id.into());
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageDecoder for InMemoryImageDecoder {
    async fn request_image(
        &self,
        asset: &AssetHandle,
        options: &ImageRequestOptions,
    ) -> Result<Option<DecodedImage>> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.failing.read().contains(&asset.id) {
            return Err(anyhow::anyhow!("Failed to decode asset {}", asset.id).into());
        }

        let Some(data) = self.images.read().get(&asset.id).cloned() else {
            return Ok(None);
        };

        let (width, height) =
            options
                .target_size
                .fit(asset.pixel_width, asset.pixel_height, options.content_mode);
        if width == 0 || height == 0 {
            return Ok(None);
        }

        Ok(Some(DecodedImage {
            asset_id: asset.id.clone(),
            width,
            height,
            data,
        }))
    }
}

/// Key-value store held as a single JSON tree.
pub struct InMemorySnapshotSource {
    root: RwLock<Value>,
    failing: RwLock<HashSet<RecordPath>>,
}

impl Default for InMemorySnapshotSource {
    fn default() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }
}

impl InMemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Store `value` at `path`, creating intermediate objects as needed.
    pub fn set(&self, path: &RecordPath, value: Value) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for segment in path.segments() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            node = map.entry(segment.to_string()).or_insert(Value::Null);
        }
        *node = value;
    }

    /// Make reads of `path` return an error.
    pub fn fail_on(&self, path: RecordPath) {
        self.failing.write().insert(path);
    }
}

#[async_trait]
impl SnapshotSource for InMemorySnapshotSource {
    async fn observe_single(&self, path: &RecordPath) -> Result<Option<Value>> {
        if self.failing.read().contains(path) {
            return Err(anyhow::anyhow!("Permission denied reading {}", path).into());
        }

        let root = self.root.read();
        let mut node = &*root;
        for segment in path.segments() {
            match node.get(segment) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }

        if node.is_null() {
            Ok(None)
        } else {
            Ok(Some(node.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentMode, TargetSize};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_asset_source_applies_query() {
        let source = InMemoryAssetSource::with_assets(
            (0..15).map(|i| AssetHandle::image(format!("a{i}"), Utc.timestamp_opt(i, 0).unwrap(), 100, 100)),
        );

        let assets = source.fetch_assets(&AssetQuery::default()).await.unwrap();
        assert_eq!(assets.len(), 10);
        assert_eq!(assets[0].id.0, "a14");
    }

    #[tokio::test]
    async fn test_unavailable_asset_source_errors() {
        let source = InMemoryAssetSource::new();
        source.set_unavailable(true);
        assert!(source.fetch_assets(&AssetQuery::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_decoder_fits_to_target() {
        let decoder = InMemoryImageDecoder::new();
        decoder.register("a", vec![1, 2, 3]);
        let asset = AssetHandle::image("a", Utc::now(), 4000, 2000);

        let image = decoder
            .request_image(&asset, &ImageRequestOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((image.width, image.height), (350, 175));
        assert_eq!(image.data, vec![1, 2, 3]);

        let fill = ImageRequestOptions {
            target_size: TargetSize::new(100, 100),
            content_mode: ContentMode::AspectFill,
        };
        let image = decoder.request_image(&asset, &fill).await.unwrap().unwrap();
        assert_eq!((image.width, image.height), (200, 100));
        assert_eq!(decoder.request_count(), 2);
    }

    #[tokio::test]
    async fn test_decoder_unregistered_and_failing_assets() {
        let decoder = InMemoryImageDecoder::new();
        decoder.register("broken", vec![0]);
        decoder.fail_on("broken");
        let options = ImageRequestOptions::default();

        let missing = AssetHandle::image("missing", Utc::now(), 10, 10);
        assert!(decoder.request_image(&missing, &options).await.unwrap().is_none());

        let broken = AssetHandle::image("broken", Utc::now(), 10, 10);
        assert!(decoder.request_image(&broken, &options).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_set_and_observe() {
        let source = InMemorySnapshotSource::new();
        source.set(&RecordPath::user("u1"), json!({"username": "jairo"}));
        source.set(&RecordPath::posts("u1").child("p1"), json!({"caption": "hi"}));

        let user = source.observe_single(&RecordPath::user("u1")).await.unwrap();
        assert_eq!(user, Some(json!({"username": "jairo"})));

        let posts = source.observe_single(&RecordPath::posts("u1")).await.unwrap();
        assert_eq!(posts, Some(json!({"p1": {"caption": "hi"}})));

        let missing = source.observe_single(&RecordPath::user("nobody")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_set_replaces_scalar_parents() {
        let source = InMemorySnapshotSource::from_value(json!({"likes": 5}));
        source.set(&RecordPath::like("p1", "u1"), json!(1));

        let like = source.observe_single(&RecordPath::like("p1", "u1")).await.unwrap();
        assert_eq!(like, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_snapshot_fail_on() {
        let source = InMemorySnapshotSource::new();
        source.fail_on(RecordPath::user("u1"));
        assert!(source.observe_single(&RecordPath::user("u1")).await.is_err());
    }
}
