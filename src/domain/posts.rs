//! The post record shared by every producer (document store, feed fetcher,
//! tweet fetcher) and every consumer (HTTP surface, prerender warmer).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

/// Query parameters that never affect page content and must not survive
/// into stored post URLs.
const TRACKING_PARAMS: &[&str] = &["utm_campaign", "utm_medium", "utm_source"];

/// Identity of whoever (or whatever) submitted a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub bot: bool,
}

impl Submitter {
    /// Submitter used for posts produced by the feed fetcher.
    pub fn rss_bot() -> Self {
        Self {
            name: "RSS bot".to_string(),
            email: String::new(),
            picture: "img/rss_icon_24px.svg".to_string(),
            bot: true,
        }
    }

    /// Submitter used for posts produced by the tweet fetcher.
    pub fn twitter_bot() -> Self {
        Self {
            name: "Twitter bot".to_string(),
            email: String::new(),
            picture: "img/twitter_icon.png".to_string(),
            bot: true,
        }
    }
}

/// A single dated feed entry. `submitted` is the ordering key for the feed;
/// `url` is the identity key for deduplication and deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub title: String,
    pub url: String,
    pub domain: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted: OffsetDateTime,
    pub submitter: Submitter,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pageviews: Option<u64>,
}

impl Post {
    /// Zero-padded `(year, month, day)` strings of the submission date,
    /// matching the document-store collection layout.
    pub fn date_parts(&self) -> (String, String, String) {
        let date = self.submitted.date();
        (
            date.year().to_string(),
            format!("{:02}", u8::from(date.month())),
            format!("{:02}", date.day()),
        )
    }
}

/// Order posts newest first by submission time.
pub fn sort_posts(posts: &mut [Post]) {
    posts.sort_by(|a, b| b.submitted.cmp(&a.submitted));
}

/// Collapse duplicates, first by URL and then by title. When two posts share
/// a key the later one wins, which lets store entries override feed entries
/// carrying the same link.
pub fn unique_posts(posts: Vec<Post>) -> Vec<Post> {
    let deduped = unique_by(posts, |post| post.url.clone());
    unique_by(deduped, |post| post.title.clone())
}

fn unique_by<K>(posts: Vec<Post>, key: impl Fn(&Post) -> K) -> Vec<Post>
where
    K: std::hash::Hash + Eq,
{
    let mut order = Vec::new();
    let mut by_key: HashMap<K, Post> = HashMap::new();
    for post in posts {
        let k = key(&post);
        if !by_key.contains_key(&k) {
            order.push(key(&post));
        }
        by_key.insert(k, post);
    }
    order
        .into_iter()
        .filter_map(|k| by_key.remove(&k))
        .collect()
}

/// Drop tracking query parameters from a link before it is stored or served.
pub fn strip_tracking_params(url: &mut Url) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !TRACKING_PARAMS.contains(&name.as_ref()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if retained.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (name, value) in &retained {
            pairs.append_pair(name, value);
        }
    }
}
