//! RSS/Atom feed collection.
//!
//! Fetches the configured blog feeds concurrently, maps entries to posts and
//! keeps the latest successful result in memory. The cache is refreshed by a
//! background task on a daily cadence and on demand through the admin
//! surface; readers never wait on the network once a result exists.

use std::sync::RwLock;
use std::time::Instant;

use futures::future::join_all;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use url::Url;

use crate::domain::authors::{AuthorRule, author_for_site};
use crate::domain::posts::{Post, Submitter, strip_tracking_params};

const SOURCE: &str = "application::feeds";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed `{url}` could not be parsed: {detail}")]
    Parse { url: String, detail: String },
}

#[derive(Clone)]
pub struct FeedService {
    http: reqwest::Client,
    feeds: Vec<String>,
    authors: Vec<AuthorRule>,
    cache: std::sync::Arc<RwLock<Vec<Post>>>,
}

impl FeedService {
    pub fn new(http: reqwest::Client, feeds: Vec<String>, authors: Vec<AuthorRule>) -> Self {
        Self {
            http,
            feeds,
            authors,
            cache: std::sync::Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Cached feed posts, refreshing first if nothing has been fetched yet.
    pub async fn collect(&self) -> Vec<Post> {
        let cached = read_lock(&self.cache, "collect").clone();
        if !cached.is_empty() {
            return cached;
        }
        self.refresh().await
    }

    /// Re-fetch every configured feed. A feed that fails to download or
    /// parse is skipped with a warning; the remaining feeds still refresh
    /// the cache.
    pub async fn refresh(&self) -> Vec<Post> {
        let started = Instant::now();
        let fetches = self.feeds.iter().map(|url| self.fetch_feed(url));
        let mut posts = Vec::new();
        for (url, result) in self.feeds.iter().zip(join_all(fetches).await) {
            match result {
                Ok(mut feed_posts) => posts.append(&mut feed_posts),
                Err(err) => warn!(
                    target = "rassegna::feeds",
                    feed = %url,
                    error = %err,
                    "skipping feed during refresh"
                ),
            }
        }

        *write_lock(&self.cache, "refresh") = posts.clone();
        info!(
            target = "rassegna::feeds",
            feeds = self.feeds.len(),
            posts = posts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "feed refresh complete"
        );
        posts
    }

    async fn fetch_feed(&self, url: &str) -> Result<Vec<Post>, FeedError> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let feed = feed_rs::parser::parse(&body[..]).map_err(|err| FeedError::Parse {
            url: url.to_string(),
            detail: err.to_string(),
        })?;
        Ok(self.map_feed(feed))
    }

    fn map_feed(&self, feed: feed_rs::model::Feed) -> Vec<Post> {
        let site_link = feed
            .links
            .first()
            .map(|link| link.href.clone())
            .unwrap_or_default();

        // Feed-level author, falling back to the configured lookup table.
        let feed_author = feed
            .authors
            .first()
            .map(|person| person.name.clone())
            .filter(|name| !name.is_empty())
            .or_else(|| author_for_site(&self.authors, &site_link))
            .unwrap_or_default();

        feed.entries
            .into_iter()
            .filter_map(|entry| map_entry(entry, &feed_author))
            .collect()
    }
}

fn map_entry(entry: feed_rs::model::Entry, feed_author: &str) -> Option<Post> {
    let link = entry.links.first()?.href.clone();
    let mut url = Url::parse(&link).ok()?;
    strip_tracking_params(&mut url);

    let submitted = entry
        .published
        .or(entry.updated)
        .and_then(|stamp| OffsetDateTime::from_unix_timestamp(stamp.timestamp()).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

    // An entry-level author overrides the feed author.
    let author = entry
        .authors
        .first()
        .map(|person| person.name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| feed_author.to_string());

    Some(Post {
        title: entry
            .title
            .map(|title| title.content)
            .unwrap_or_default(),
        domain: url.host_str().unwrap_or_default().to_string(),
        url: url.into(),
        submitted,
        submitter: Submitter::rss_bot(),
        author,
        pageviews: None,
    })
}

fn read_lock<'a>(
    lock: &'a RwLock<Vec<Post>>,
    op: &'static str,
) -> std::sync::RwLockReadGuard<'a, Vec<Post>> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!(op, source = SOURCE, "recovered poisoned feed cache lock");
        poisoned.into_inner()
    })
}

fn write_lock<'a>(
    lock: &'a RwLock<Vec<Post>>,
    op: &'static str,
) -> std::sync::RwLockWriteGuard<'a, Vec<Post>> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!(op, source = SOURCE, "recovered poisoned feed cache lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Dev Blog</title>
  <link href="https://blog.example.dev/"/>
  <id>urn:example:feed</id>
  <updated>2020-01-15T08:00:00Z</updated>
  <entry>
    <title>Shipping a thing</title>
    <link href="https://blog.example.dev/shipping?utm_source=rss&amp;utm_medium=feed"/>
    <id>urn:example:1</id>
    <published>2020-01-14T08:00:00Z</published>
    <updated>2020-01-14T08:00:00Z</updated>
    <author><name>Ada Lovelace</name></author>
  </entry>
  <entry>
    <title>Second post</title>
    <link href="https://blog.example.dev/second"/>
    <id>urn:example:2</id>
    <updated>2020-01-15T08:00:00Z</updated>
  </entry>
</feed>"#;

    fn service_with_rules(rules: Vec<AuthorRule>) -> FeedService {
        FeedService::new(reqwest::Client::new(), Vec::new(), rules)
    }

    #[test]
    fn maps_feed_entries_to_posts() {
        let feed = feed_rs::parser::parse(SAMPLE_FEED.as_bytes()).expect("parse feed");
        let service = service_with_rules(vec![AuthorRule {
            url_pattern: Some("blog.example.dev".to_string()),
            github_pattern: None,
            author: "Site Author".to_string(),
        }]);

        let posts = service.map_feed(feed);
        assert_eq!(posts.len(), 2);

        let first = &posts[0];
        assert_eq!(first.title, "Shipping a thing");
        assert_eq!(first.url, "https://blog.example.dev/shipping");
        assert_eq!(first.domain, "blog.example.dev");
        assert_eq!(first.author, "Ada Lovelace");
        assert!(first.submitter.bot);
        assert_eq!(first.submitted.year(), 2020);

        // No entry author: the lookup-table site author applies.
        assert_eq!(posts[1].author, "Site Author");
    }

    #[tokio::test]
    async fn refresh_with_no_feeds_is_empty() {
        let service = service_with_rules(Vec::new());
        assert!(service.refresh().await.is_empty());
        assert!(service.collect().await.is_empty());
    }
}
