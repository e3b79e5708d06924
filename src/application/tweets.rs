//! Tweet collection for the configured account(s).
//!
//! Pulls a user timeline from the Twitter REST API, drops replies and maps
//! the remainder to posts. Results are cached per screen name; upstream
//! failures degrade to an empty list so a broken API never takes down the
//! feed or a render.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::{info, warn};

use crate::domain::posts::{Post, Submitter};

/// `created_at` as emitted by the v1.1 statuses endpoints,
/// e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const TWITTER_TIME: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short] [month repr:short] [day] [hour]:[minute]:[second] \
     [offset_hour sign:mandatory][offset_minute] [year]"
);

const TIMELINE_COUNT: u32 = 200;

#[derive(Debug, Error)]
pub enum TweetError {
    #[error("timeline request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no API credentials configured")]
    MissingCredentials,
}

#[derive(Debug, Deserialize)]
struct TimelineTweet {
    text: String,
    id_str: String,
    created_at: String,
    #[serde(default)]
    in_reply_to_user_id: Option<i64>,
}

#[derive(Clone)]
pub struct TweetService {
    http: reqwest::Client,
    api_base: String,
    bearer_token: Option<String>,
    cache: Arc<DashMap<String, Vec<Post>>>,
}

impl TweetService {
    pub fn new(http: reqwest::Client, api_base: String, bearer_token: Option<String>) -> Self {
        Self {
            http,
            api_base,
            bearer_token,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Cached tweets for `screen_name`, fetching on first use.
    pub async fn tweets(&self, screen_name: &str) -> Vec<Post> {
        if let Some(cached) = self.cache.get(screen_name) {
            return cached.clone();
        }
        self.refresh(screen_name).await
    }

    /// Re-fetch the timeline. Any failure is logged and yields an empty
    /// list; a previously cached timeline is left in place.
    pub async fn refresh(&self, screen_name: &str) -> Vec<Post> {
        let started = Instant::now();
        match self.fetch_timeline(screen_name).await {
            Ok(posts) => {
                self.cache.insert(screen_name.to_string(), posts.clone());
                info!(
                    target = "rassegna::tweets",
                    screen_name,
                    tweets = posts.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tweet refresh complete"
                );
                posts
            }
            Err(err) => {
                warn!(
                    target = "rassegna::tweets",
                    screen_name,
                    error = %err,
                    "tweet refresh failed"
                );
                Vec::new()
            }
        }
    }

    async fn fetch_timeline(&self, screen_name: &str) -> Result<Vec<Post>, TweetError> {
        let token = self
            .bearer_token
            .as_deref()
            .ok_or(TweetError::MissingCredentials)?;

        let url = format!("{}/statuses/user_timeline.json", self.api_base);
        let count = TIMELINE_COUNT.to_string();
        let tweets: Vec<TimelineTweet> = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[("screen_name", screen_name), ("count", count.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(map_timeline(screen_name, tweets))
    }
}

fn map_timeline(screen_name: &str, tweets: Vec<TimelineTweet>) -> Vec<Post> {
    tweets
        .into_iter()
        .filter(|tweet| tweet.in_reply_to_user_id.is_none())
        .map(|tweet| Post {
            title: tweet.text,
            url: format!("https://twitter.com/{screen_name}/status/{}", tweet.id_str),
            domain: "twitter.com".to_string(),
            submitted: OffsetDateTime::parse(&tweet.created_at, TWITTER_TIME)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            submitter: Submitter::twitter_bot(),
            author: screen_name.to_string(),
            pageviews: None,
        })
        .collect()
}
