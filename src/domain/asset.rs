//! Photo-library asset references and the query used to enumerate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Library-local identifier of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        AssetId(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        AssetId(id)
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

/// Handle to one asset in the device photo library.
///
/// Carries just enough metadata to sort and size the asset; pixel data is only
/// produced by an [`ImageDecoder`](crate::source::ImageDecoder).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetHandle {
    pub id: AssetId,
    pub media_type: MediaType,
    pub created_at: DateTime<Utc>,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl AssetHandle {
    pub fn image(id: impl Into<AssetId>, created_at: DateTime<Utc>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Image,
            created_at,
            pixel_width: width,
            pixel_height: height,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.pixel_width) * u64::from(self.pixel_height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    CreationDate,
    PixelCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub key: SortKey,
    pub ascending: bool,
}

impl SortDescriptor {
    /// Order two assets according to this descriptor.
    pub fn compare(&self, a: &AssetHandle, b: &AssetHandle) -> std::cmp::Ordering {
        let ordering = match self.key {
            SortKey::CreationDate => a.created_at.cmp(&b.created_at),
            SortKey::PixelCount => a.pixel_count().cmp(&b.pixel_count()),
        };
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

/// Query against an [`AssetSource`](crate::source::AssetSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetQuery {
    /// Maximum number of assets to return. Zero means no limit.
    pub limit: usize,
    pub media_type: MediaType,
    pub sort: SortDescriptor,
}

impl Default for AssetQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            media_type: MediaType::Image,
            sort: SortDescriptor {
                key: SortKey::CreationDate,
                ascending: false,
            },
        }
    }
}

impl AssetQuery {
    /// Filter, sort and truncate `assets` the way a library fetch would.
    pub fn apply<'a>(&self, assets: impl IntoIterator<Item = &'a AssetHandle>) -> Vec<AssetHandle> {
        let mut matching: Vec<AssetHandle> = assets
            .into_iter()
            .filter(|asset| asset.media_type == self.media_type)
            .cloned()
            .collect();
        // Stable sort so equal keys keep library order
        matching.sort_by(|a, b| self.sort.compare(a, b));
        if self.limit > 0 {
            matching.truncate(self.limit);
        }
        matching
    }
}
