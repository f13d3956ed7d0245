//! Value objects mapped from remote key-value snapshots.
//!
//! Snapshots are plain `serde_json::Value` trees. Mapping is lenient about
//! individual fields (missing or mistyped fields fall back to defaults) but a
//! snapshot that is not an object at all is treated as malformed and yields `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Slash-separated path into the snapshot tree, e.g. `users/<uid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPath(String);

impl RecordPath {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        RecordPath(path.trim_matches('/').to_string())
    }

    pub fn user(uid: &str) -> Self {
        Self::new("users").child(uid)
    }

    pub fn posts(uid: &str) -> Self {
        Self::new("posts").child(uid)
    }

    pub fn like(post_id: &str, viewer_uid: &str) -> Self {
        Self::new("likes").child(post_id).child(viewer_uid)
    }

    pub fn child(&self, key: &str) -> Self {
        let key = key.trim_matches('/');
        if self.0.is_empty() {
            RecordPath(key.to_string())
        } else {
            RecordPath(format!("{}/{}", self.0, key))
        }
    }

    /// Path segments, skipping empty ones.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Final segment of the path, which is the record's key in its parent.
    pub fn key(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Types that can be built from a single snapshot.
pub trait FromSnapshot: Sized {
    /// Build a value from the snapshot stored under `key`.
    ///
    /// Returns `None` when the snapshot is malformed.
    fn from_snapshot(key: &str, value: &Value) -> Option<Self>;
}

fn string_field(dictionary: &Map<String, Value>, field: &str) -> String {
    dictionary
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub username: String,
    pub profile_image_url: String,
}

impl FromSnapshot for User {
    fn from_snapshot(key: &str, value: &Value) -> Option<Self> {
        let dictionary = value.as_object()?;
        Some(User {
            uid: key.to_string(),
            username: string_field(dictionary, "username"),
            profile_image_url: string_field(dictionary, "profileImageURL"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user: User,
    pub image_url: String,
    pub caption: String,
    pub creation_date: DateTime<Utc>,
    pub has_liked: bool,
}

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 4 * WEEK;

impl Post {
    /// Map a post snapshot. `has_liked` starts false; the liked state lives
    /// under a separate path and is filled in by the resolver.
    pub fn from_snapshot(id: &str, user: User, value: &Value) -> Option<Self> {
        let dictionary = value.as_object()?;
        let seconds = dictionary
            .get("creationDate")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let creation_date =
            DateTime::from_timestamp_millis((seconds * 1000.0) as i64).unwrap_or_default();

        Some(Post {
            id: id.to_string(),
            user,
            image_url: string_field(dictionary, "imageUrl"),
            caption: string_field(dictionary, "caption"),
            creation_date,
            has_liked: false,
        })
    }

    /// Human readable age such as `"3 hours ago"` or `"1 week ago"`.
    pub fn time_ago_display(&self, now: DateTime<Utc>) -> String {
        let seconds_ago = (now - self.creation_date).num_seconds().max(0);

        let (quotient, unit) = if seconds_ago < MINUTE {
            (seconds_ago, "second")
        } else if seconds_ago < HOUR {
            (seconds_ago / MINUTE, "minute")
        } else if seconds_ago < DAY {
            (seconds_ago / HOUR, "hour")
        } else if seconds_ago < WEEK {
            (seconds_ago / DAY, "day")
        } else if seconds_ago < MONTH {
            (seconds_ago / WEEK, "week")
        } else {
            (seconds_ago / MONTH, "month")
        };

        let plural = if quotient == 1 { "" } else { "s" };
        format!("{quotient} {unit}{plural} ago")
    }
}
