//! Store-change watcher.
//!
//! Subscribes to the post store's change stream and keeps the render cache
//! honest: every batch touching the watched year invalidates all cached
//! variants of the public origin, then eagerly re-renders the public page so
//! the next real request hits a warm cache instead of paying for the miss.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::application::repos::PostStore;

use super::service::{Prerenderer, RenderOptions};

pub fn spawn_change_watcher(
    store: Arc<dyn PostStore>,
    prerenderer: Arc<Prerenderer>,
    public_url: Url,
    year: String,
) -> JoinHandle<()> {
    let mut changes = store.watch();
    let origin = public_url.origin().ascii_serialization();

    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(batch) => {
                    if !batch.touches_year(&year) {
                        debug!(
                            target = "rassegna::prerender::watch",
                            year = %year,
                            "ignoring change batch outside watched year"
                        );
                        continue;
                    }

                    let removed = prerenderer.invalidate_origin(&origin);
                    info!(
                        target = "rassegna::prerender::watch",
                        changes = batch.changes.len(),
                        removed,
                        "store change invalidated cached renders"
                    );

                    // Warm the cache back up so the next request is fast.
                    if let Err(err) = prerenderer
                        .render(public_url.as_str(), &RenderOptions::default())
                        .await
                    {
                        warn!(
                            target = "rassegna::prerender::watch",
                            error = %err,
                            "cache warming render failed"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Missed batches collapse into one conservative sweep.
                    warn!(
                        target = "rassegna::prerender::watch",
                        skipped, "change stream lagged, invalidating origin"
                    );
                    prerenderer.invalidate_origin(&origin);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use tokio::time::{Duration, sleep};

    use crate::domain::posts::{Post, Submitter};
    use crate::infra::store::MemoryPostStore;
    use crate::prerender::service::PrerenderConfig;

    use super::*;

    #[tokio::test]
    async fn change_batch_invalidates_cached_origin() {
        let store = Arc::new(MemoryPostStore::new(Vec::new()));
        let prerenderer = Arc::new(Prerenderer::new(PrerenderConfig::default()));

        // Seed a cached render for the public origin. The warming render
        // after invalidation fails (no browser here), which the watcher
        // tolerates; what matters is that the stale entry is gone.
        prerenderer
            .cache()
            .insert("http://localhost:8080/?year=2020".to_string(), "stale".to_string());

        let submitted = OffsetDateTime::now_utc();
        let year = submitted.year().to_string();
        let handle = spawn_change_watcher(
            store.clone(),
            Arc::clone(&prerenderer),
            Url::parse("http://localhost:8080/").expect("valid url"),
            year,
        );

        store
            .new_post(Post {
                title: "fresh".to_string(),
                url: "https://a.dev/fresh".to_string(),
                domain: "a.dev".to_string(),
                submitted,
                submitter: Submitter::rss_bot(),
                author: String::new(),
                pageviews: None,
            })
            .await
            .expect("new_post");

        // Give the watcher a moment to observe the batch.
        for _ in 0..50 {
            if prerenderer
                .cache()
                .get("http://localhost:8080/?year=2020")
                .is_none()
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(
            prerenderer
                .cache()
                .get("http://localhost:8080/?year=2020")
                .is_none()
        );

        handle.abort();
    }
}
