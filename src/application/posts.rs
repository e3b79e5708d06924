use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::application::repos::{PostStore, RepoError};
use crate::domain::posts::{Post, sort_posts, strip_tracking_params, unique_posts};

/// Read/write facade over the document store that merges externally produced
/// posts (feeds, tweets) into the stored feed.
#[derive(Clone)]
pub struct PostService {
    store: Arc<dyn PostStore>,
}

impl PostService {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    /// The merged feed for a period: stored submissions plus `extra` posts
    /// from the feed/tweet producers, filtered to the same period, newest
    /// first and deduplicated. Stored posts win over extras sharing a URL.
    pub async fn get_posts(
        &self,
        year: &str,
        month: Option<&str>,
        day: Option<&str>,
        extra: Vec<Post>,
        max_results: Option<usize>,
    ) -> Result<Vec<Post>, RepoError> {
        let mut merged: Vec<Post> = extra
            .into_iter()
            .filter(|post| in_period(post, year, month, day))
            .collect();

        let stored = self.store.get_posts(year, month, day, None).await?;
        debug!(
            target = "rassegna::posts",
            year,
            month = month.unwrap_or(""),
            day = day.unwrap_or(""),
            stored = stored.len(),
            merged = merged.len(),
            "merging feed posts with stored posts"
        );
        merged.extend(stored);

        sort_posts(&mut merged);
        let mut posts = unique_posts(merged);
        if let Some(max) = max_results {
            posts.truncate(max);
        }
        Ok(posts)
    }

    /// Validate and persist a submitted post. The link is normalized before
    /// storage so tracking parameters never become part of post identity.
    pub async fn submit(&self, mut post: Post) -> Result<(), RepoError> {
        if post.title.trim().is_empty() {
            return Err(RepoError::InvalidInput("post title is empty".into()));
        }
        let mut url = Url::parse(&post.url)
            .map_err(|err| RepoError::InvalidInput(format!("post url: {err}")))?;
        strip_tracking_params(&mut url);
        if post.domain.is_empty() {
            post.domain = url.host_str().unwrap_or_default().to_string();
        }
        post.url = url.into();

        self.store.new_post(post).await
    }

    pub async fn delete(&self, year: &str, month: &str, url: &str) -> Result<(), RepoError> {
        self.store.delete_post(year, month, url).await
    }
}

fn in_period(post: &Post, year: &str, month: Option<&str>, day: Option<&str>) -> bool {
    let (post_year, post_month, post_day) = post.date_parts();
    if post_year != year {
        return false;
    }
    if let Some(month) = month
        && post_month != month
    {
        return false;
    }
    if let Some(day) = day
        && post_day != day
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::domain::posts::Submitter;
    use crate::infra::store::MemoryPostStore;

    use super::*;

    fn feed_post(title: &str, url: &str, submitted: time::OffsetDateTime) -> Post {
        Post {
            title: title.to_string(),
            url: url.to_string(),
            domain: "a.dev".to_string(),
            submitted,
            submitter: Submitter::rss_bot(),
            author: String::new(),
            pageviews: None,
        }
    }

    fn service() -> PostService {
        PostService::new(Arc::new(MemoryPostStore::new(Vec::new())))
    }

    #[tokio::test]
    async fn merges_and_filters_by_period() {
        let service = service();
        service
            .submit(feed_post(
                "stored",
                "https://a.dev/stored",
                datetime!(2020-05-02 10:00 UTC),
            ))
            .await
            .expect("submit");

        let extra = vec![
            feed_post("in year", "https://a.dev/1", datetime!(2020-01-15 00:00 UTC)),
            feed_post("other year", "https://a.dev/2", datetime!(2019-01-15 00:00 UTC)),
        ];

        let posts = service
            .get_posts("2020", None, None, extra, None)
            .await
            .expect("get_posts");
        let titles: Vec<_> = posts.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["stored", "in year"]);
    }

    #[tokio::test]
    async fn month_and_day_narrow_the_feed() {
        let service = service();
        let extra = vec![
            feed_post("may 2", "https://a.dev/1", datetime!(2020-05-02 00:00 UTC)),
            feed_post("may 9", "https://a.dev/2", datetime!(2020-05-09 00:00 UTC)),
            feed_post("june", "https://a.dev/3", datetime!(2020-06-01 00:00 UTC)),
        ];

        let may = service
            .get_posts("2020", Some("05"), None, extra.clone(), None)
            .await
            .expect("get_posts");
        assert_eq!(may.len(), 2);

        let may_2 = service
            .get_posts("2020", Some("05"), Some("02"), extra, None)
            .await
            .expect("get_posts");
        assert_eq!(may_2.len(), 1);
        assert_eq!(may_2[0].title, "may 2");
    }

    #[tokio::test]
    async fn stored_post_wins_over_feed_duplicate() {
        let service = service();
        let mut stored = feed_post(
            "same link",
            "https://a.dev/shared",
            datetime!(2020-05-02 10:00 UTC),
        );
        stored.author = "Stored Author".to_string();
        service.submit(stored).await.expect("submit");

        let extra = vec![feed_post(
            "same link",
            "https://a.dev/shared",
            datetime!(2020-05-02 10:00 UTC),
        )];

        let posts = service
            .get_posts("2020", None, None, extra, None)
            .await
            .expect("get_posts");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].author, "Stored Author");
    }

    #[tokio::test]
    async fn max_results_truncates() {
        let service = service();
        let extra = (0..5)
            .map(|i| {
                feed_post(
                    &format!("post {i}"),
                    &format!("https://a.dev/{i}"),
                    datetime!(2020-05-02 00:00 UTC) + time::Duration::hours(i),
                )
            })
            .collect();

        let posts = service
            .get_posts("2020", None, None, extra, Some(2))
            .await
            .expect("get_posts");
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].title, "post 4");
    }

    #[tokio::test]
    async fn submit_rejects_bad_payloads() {
        let service = service();
        let mut post = feed_post("", "https://a.dev/x", datetime!(2020-05-02 00:00 UTC));
        assert!(matches!(
            service.submit(post.clone()).await,
            Err(RepoError::InvalidInput(_))
        ));

        post.title = "ok".to_string();
        post.url = "not a url".to_string();
        assert!(matches!(
            service.submit(post).await,
            Err(RepoError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn submit_strips_tracking_params() {
        let store = Arc::new(MemoryPostStore::new(Vec::new()));
        let service = PostService::new(store.clone());
        service
            .submit(feed_post(
                "tracked",
                "https://a.dev/post?utm_source=feed&id=7",
                datetime!(2020-05-02 00:00 UTC),
            ))
            .await
            .expect("submit");

        let posts = store
            .get_posts("2020", None, None, None)
            .await
            .expect("get_posts");
        assert_eq!(posts[0].url, "https://a.dev/post?id=7");
    }
}
