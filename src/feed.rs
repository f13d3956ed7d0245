//! Profile and feed loading over a key-value snapshot store.
//!
//! Layout of the store:
//! - `users/<uid>`: user object (`username`, `profileImageURL`)
//! - `posts/<uid>/<post_id>`: post object (`imageUrl`, `caption`, `creationDate`)
//! - `likes/<post_id>/<uid>`: `1` when the user has liked the post

use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{FromSnapshot, Post, RecordPath, User};
use crate::error::Result;
use crate::loader::{BatchLoader, LoaderConfig};
use crate::source::{PostHandle, PostResolver, SnapshotResolver, SnapshotSource};

/// Configuration for profile and feed loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFeedConfig {
    pub users: LoaderConfig,
    pub posts: LoaderConfig,
}

impl Default for ProfileFeedConfig {
    fn default() -> Self {
        Self {
            users: LoaderConfig::named("users"),
            posts: LoaderConfig::named("posts"),
        }
    }
}

/// Loads users and their posts as seen by one viewer.
pub struct ProfileFeed<S: SnapshotSource + 'static> {
    source: Arc<S>,
    users: BatchLoader<SnapshotResolver<S, User>>,
    posts: BatchLoader<PostResolver<S>>,
}

impl<S: SnapshotSource + 'static> ProfileFeed<S> {
    /// Create a feed for `viewer_uid`; posts report whether this viewer liked them.
    pub fn new(source: Arc<S>, viewer_uid: Option<String>, config: ProfileFeedConfig) -> Result<Self> {
        let shutdown_token = CancellationToken::new();
        let users = BatchLoader::new(Arc::new(SnapshotResolver::new(source.clone())), config.users)?
            .with_shutdown_token(shutdown_token.clone());
        let posts = BatchLoader::new(Arc::new(PostResolver::new(source.clone(), viewer_uid)), config.posts)?
            .with_shutdown_token(shutdown_token);
        Ok(Self {
            source,
            users,
            posts,
        })
    }

    pub fn users_loader(&self) -> &BatchLoader<SnapshotResolver<S, User>> {
        &self.users
    }

    pub fn posts_loader(&self) -> &BatchLoader<PostResolver<S>> {
        &self.posts
    }

    /// Read a single user.
    ///
    /// Returns `Ok(None)` if the user does not exist or the stored value is
    /// not a user object.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_user(&self, uid: &str) -> Result<Option<User>> {
        let Some(value) = self.source.observe_single(&RecordPath::user(uid)).await? else {
            return Ok(None);
        };
        let user = User::from_snapshot(uid, &value);
        if user.is_none() {
            tracing::warn!(uid, "Malformed user snapshot");
        }
        Ok(user)
    }

    /// Read several users as one batch, keeping the order of `uids` and
    /// skipping any that are missing or malformed.
    #[tracing::instrument(skip_all, fields(count = uids.len()))]
    pub async fn fetch_users(&self, uids: &[String]) -> Result<Vec<User>> {
        let paths = uids.iter().map(|uid| RecordPath::user(uid)).collect();
        self.users.load_chunked(paths).await
    }

    /// Paths of every post by `uid`, in key order.
    pub async fn post_paths(&self, uid: &str) -> Result<Vec<RecordPath>> {
        let parent = RecordPath::posts(uid);
        match self.source.observe_single(&parent).await? {
            Some(Value::Object(posts)) => Ok(posts.keys().map(|key| parent.child(key)).collect()),
            Some(_) => {
                tracing::warn!(uid, "Posts snapshot is not an object, ignoring");
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Load every post by `author`, newest first.
    #[tracing::instrument(skip_all, fields(uid = %author.uid))]
    pub async fn fetch_posts(&self, author: &User) -> Result<Vec<Post>> {
        let author = Arc::new(author.clone());
        let handles = self
            .post_paths(&author.uid)
            .await?
            .into_iter()
            .map(|path| PostHandle {
                path,
                author: author.clone(),
            })
            .collect();

        let mut posts = self.posts.load_chunked(handles).await?;
        sort_newest_first(&mut posts);
        Ok(posts)
    }

    /// Load the posts of every user in `uids` as a single feed, newest first.
    #[tracing::instrument(skip_all, fields(count = uids.len()))]
    pub async fn fetch_feed(&self, uids: &[String]) -> Result<Vec<Post>> {
        let users = self.fetch_users(uids).await?;
        let per_user = try_join_all(users.iter().map(|user| self.fetch_posts(user))).await?;

        let mut feed: Vec<Post> = per_user.into_iter().flatten().collect();
        sort_newest_first(&mut feed);
        tracing::debug!(users = users.len(), posts = feed.len(), "Feed loaded");
        Ok(feed)
    }

    /// Cancel in-flight loads and reject new ones.
    pub fn shutdown(&self) {
        self.users.shutdown();
        self.posts.shutdown();
    }
}

fn sort_newest_first(posts: &mut [Post]) {
    posts.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
}
