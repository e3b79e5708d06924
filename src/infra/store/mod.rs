//! In-memory document store.
//!
//! Stands in for the external document database behind [`PostStore`]:
//! posts live in month documents grouped by year, mirroring the collection
//! layout of the hosted store this service deploys against. Every mutation
//! emits a change batch on a broadcast channel; the initial state is never
//! replayed to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::application::repos::{ChangeBatch, ChangeKind, DocChange, PostStore, RepoError};
use crate::domain::authors::{AuthorRule, author_for_submission};
use crate::domain::posts::{Post, sort_posts};

const SOURCE: &str = "infra::store";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

type YearDocs = HashMap<String, BTreeMap<String, Vec<Post>>>;

pub struct MemoryPostStore {
    years: RwLock<YearDocs>,
    changes: broadcast::Sender<ChangeBatch>,
    authors: Vec<AuthorRule>,
}

impl MemoryPostStore {
    pub fn new(authors: Vec<AuthorRule>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            years: RwLock::new(HashMap::new()),
            changes,
            authors,
        }
    }

    fn publish(&self, change: DocChange) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.changes.send(ChangeBatch {
            changes: vec![change],
        });
    }

    fn read(&self, op: &'static str) -> RwLockReadGuard<'_, YearDocs> {
        self.years.read().unwrap_or_else(|poisoned| {
            warn!(op, source = SOURCE, "recovered poisoned store lock");
            poisoned.into_inner()
        })
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, YearDocs> {
        self.years.write().unwrap_or_else(|poisoned| {
            warn!(op, source = SOURCE, "recovered poisoned store lock");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn get_posts(
        &self,
        year: &str,
        month: Option<&str>,
        day: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<Post>, RepoError> {
        let years = self.read("get_posts");
        let mut posts: Vec<Post> = match years.get(year) {
            Some(months) => match month {
                Some(month) => months.get(month).cloned().unwrap_or_default(),
                None => months.values().flatten().cloned().collect(),
            },
            None => Vec::new(),
        };
        drop(years);

        if let Some(day) = day {
            posts.retain(|post| post.date_parts().2 == day);
        }

        sort_posts(&mut posts);
        if let Some(max) = max_results {
            posts.truncate(max);
        }
        Ok(posts)
    }

    async fn new_post(&self, mut post: Post) -> Result<(), RepoError> {
        let (year, month, _) = post.date_parts();

        // Gist and raw-github submissions carry no author; resolve one from
        // the configured handle table.
        if post.author.is_empty()
            && let Some(author) = author_for_submission(&self.authors, &post.url)
        {
            post.author = author;
        }

        let url = post.url.clone();
        {
            let mut years = self.write("new_post");
            let items = years
                .entry(year.clone())
                .or_default()
                .entry(month.clone())
                .or_default();

            if items.iter().any(|existing| existing.url == post.url) {
                debug!(
                    target = "rassegna::store",
                    url = %post.url,
                    "skipping duplicate submission"
                );
                return Ok(());
            }
            items.push(post);
        }

        self.publish(DocChange {
            year,
            month,
            kind: ChangeKind::Added,
            url,
        });
        Ok(())
    }

    async fn delete_post(&self, year: &str, month: &str, url: &str) -> Result<(), RepoError> {
        {
            let mut years = self.write("delete_post");
            let items = years
                .get_mut(year)
                .and_then(|months| months.get_mut(month))
                .ok_or_else(|| RepoError::NotFound {
                    year: year.to_string(),
                    month: month.to_string(),
                    url: url.to_string(),
                })?;

            let index =
                items
                    .iter()
                    .position(|post| post.url == url)
                    .ok_or_else(|| RepoError::NotFound {
                        year: year.to_string(),
                        month: month.to_string(),
                        url: url.to_string(),
                    })?;
            items.remove(index);
        }

        self.publish(DocChange {
            year: year.to_string(),
            month: month.to_string(),
            kind: ChangeKind::Removed,
            url: url.to_string(),
        });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::domain::posts::Submitter;

    use super::*;

    fn post(url: &str, submitted: time::OffsetDateTime) -> Post {
        Post {
            title: format!("post at {url}"),
            url: url.to_string(),
            domain: "a.dev".to_string(),
            submitted,
            submitter: Submitter::rss_bot(),
            author: String::new(),
            pageviews: None,
        }
    }

    #[tokio::test]
    async fn stores_posts_under_their_month_document() {
        let store = MemoryPostStore::new(Vec::new());
        store
            .new_post(post("https://a.dev/jan", datetime!(2020-01-10 00:00 UTC)))
            .await
            .expect("new_post");
        store
            .new_post(post("https://a.dev/feb", datetime!(2020-02-10 00:00 UTC)))
            .await
            .expect("new_post");

        let all = store
            .get_posts("2020", None, None, None)
            .await
            .expect("get_posts");
        assert_eq!(all.len(), 2);

        let january = store
            .get_posts("2020", Some("01"), None, None)
            .await
            .expect("get_posts");
        assert_eq!(january.len(), 1);
        assert_eq!(january[0].url, "https://a.dev/jan");

        let empty = store
            .get_posts("2019", None, None, None)
            .await
            .expect("get_posts");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn duplicate_urls_are_skipped_silently() {
        let store = MemoryPostStore::new(Vec::new());
        let first = post("https://a.dev/x", datetime!(2020-01-10 00:00 UTC));
        store.new_post(first.clone()).await.expect("new_post");
        store.new_post(first).await.expect("duplicate new_post");

        let all = store
            .get_posts("2020", None, None, None)
            .await
            .expect("get_posts");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_and_missing_is_an_error() {
        let store = MemoryPostStore::new(Vec::new());
        store
            .new_post(post("https://a.dev/x", datetime!(2020-01-10 00:00 UTC)))
            .await
            .expect("new_post");

        store
            .delete_post("2020", "01", "https://a.dev/x")
            .await
            .expect("delete");
        assert!(
            store
                .get_posts("2020", None, None, None)
                .await
                .expect("get_posts")
                .is_empty()
        );

        assert!(matches!(
            store.delete_post("2020", "01", "https://a.dev/x").await,
            Err(RepoError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn mutations_emit_change_batches() {
        let store = MemoryPostStore::new(Vec::new());
        let mut changes = store.watch();

        store
            .new_post(post("https://a.dev/x", datetime!(2020-01-10 00:00 UTC)))
            .await
            .expect("new_post");
        let batch = changes.recv().await.expect("change batch");
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].kind, ChangeKind::Added);
        assert!(batch.touches_year("2020"));
        assert!(!batch.touches_year("2019"));

        store
            .delete_post("2020", "01", "https://a.dev/x")
            .await
            .expect("delete");
        let batch = changes.recv().await.expect("change batch");
        assert_eq!(batch.changes[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn submission_author_is_resolved_from_rules() {
        let store = MemoryPostStore::new(vec![AuthorRule {
            url_pattern: None,
            github_pattern: Some("gist.github.com/ada".to_string()),
            author: "Ada Lovelace".to_string(),
        }]);

        store
            .new_post(post(
                "https://gist.github.com/ada/abc",
                datetime!(2020-01-10 00:00 UTC),
            ))
            .await
            .expect("new_post");

        let posts = store
            .get_posts("2020", None, None, None)
            .await
            .expect("get_posts");
        assert_eq!(posts[0].author, "Ada Lovelace");
    }
}
