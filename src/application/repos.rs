//! Boundary to the external document store holding submitted posts.
//!
//! Documents are grouped by year (collection) and month (document), each
//! month holding an ordered list of posts. The store also exposes a change
//! stream so the prerender cache can be invalidated when data mutates.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::posts::Post;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("no post for `{url}` in {year}/{month}")]
    NotFound {
        year: String,
        month: String,
        url: String,
    },
    #[error("invalid post payload: {0}")]
    InvalidInput(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What happened to a single post within a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// One mutated month document.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub year: String,
    pub month: String,
    pub kind: ChangeKind,
    pub url: String,
}

/// A batch of changes emitted once per store mutation.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub changes: Vec<DocChange>,
}

impl ChangeBatch {
    pub fn touches_year(&self, year: &str) -> bool {
        self.changes.iter().any(|change| change.year == year)
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Posts submitted in `year`, optionally narrowed to a month and day
    /// (both zero-padded), newest first, truncated to `max_results`.
    async fn get_posts(
        &self,
        year: &str,
        month: Option<&str>,
        day: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<Post>, RepoError>;

    /// Insert a post into the month document derived from its submission
    /// date. Submitting a URL that already exists in that document is a
    /// silent no-op.
    async fn new_post(&self, post: Post) -> Result<(), RepoError>;

    /// Remove the post with `url` from the given month document.
    async fn delete_post(&self, year: &str, month: &str, url: &str) -> Result<(), RepoError>;

    /// Subscribe to change batches. Batches carry their year so a consumer
    /// watching a single year can filter with [`ChangeBatch::touches_year`];
    /// the initial data snapshot is never replayed.
    fn watch(&self) -> broadcast::Receiver<ChangeBatch>;
}
