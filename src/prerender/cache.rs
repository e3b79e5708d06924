//! Rendered-page cache.
//!
//! Maps a fully qualified URL (page-affecting query parameters included) to
//! the last serialized HTML for it. There is no expiry: rendering costs
//! hundreds of milliseconds to seconds while the underlying data changes
//! rarely, so freshness is driven entirely by explicit invalidation from the
//! store change watcher and the admin rebuild surface. The LRU bound only
//! caps memory; eviction can drop an entry early but never serves a stale
//! one.

use std::num::NonZeroUsize;
use std::sync::{RwLock, RwLockWriteGuard};

use lru::LruCache;
use metrics::counter;
use tracing::warn;

const SOURCE: &str = "prerender::cache";

pub const DEFAULT_CAPACITY: usize = 128;

pub struct RenderCache {
    pages: RwLock<LruCache<String, String>>,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).expect("nonzero default"));
        Self {
            pages: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        let hit = self.write("get").get(url).cloned();
        match hit {
            Some(html) => {
                counter!("rassegna_render_cache_hit_total").increment(1);
                Some(html)
            }
            None => {
                counter!("rassegna_render_cache_miss_total").increment(1);
                None
            }
        }
    }

    pub fn insert(&self, url: String, html: String) {
        let mut pages = self.write("insert");
        // push returns the replaced entry; only a different key is a real
        // capacity eviction rather than a refresh of the same URL.
        if let Some((evicted, _)) = pages.push(url.clone(), html)
            && evicted != url
        {
            counter!("rassegna_render_cache_evict_total").increment(1);
        }
    }

    pub fn remove(&self, url: &str) -> bool {
        self.write("remove").pop(url).is_some()
    }

    /// Drop every entry whose key starts with `origin`. Used when any data
    /// behind a page changes, since several query-parameter variants of the
    /// same origin may all be affected.
    pub fn remove_origin(&self, origin: &str) -> usize {
        let mut pages = self.write("remove_origin");
        let doomed: Vec<String> = pages
            .iter()
            .filter(|(url, _)| url.starts_with(origin))
            .map(|(url, _)| url.clone())
            .collect();
        for url in &doomed {
            pages.pop(url);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.write("clear").clear();
    }

    pub fn len(&self) -> usize {
        self.write("len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, LruCache<String, String>> {
        self.pages.write().unwrap_or_else(|poisoned| {
            warn!(
                op,
                target_module = SOURCE,
                result = "poisoned_recovered",
                "recovered poisoned render cache lock"
            );
            poisoned.into_inner()
        })
    }
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_point_invalidation() {
        let cache = RenderCache::default();
        assert!(cache.get("https://a.dev/?year=2020").is_none());

        cache.insert("https://a.dev/?year=2020".to_string(), "<html>a</html>".to_string());
        assert_eq!(
            cache.get("https://a.dev/?year=2020").as_deref(),
            Some("<html>a</html>")
        );

        assert!(cache.remove("https://a.dev/?year=2020"));
        assert!(cache.get("https://a.dev/?year=2020").is_none());
        assert!(!cache.remove("https://a.dev/?year=2020"));
    }

    #[test]
    fn origin_invalidation_removes_all_variants() {
        let cache = RenderCache::default();
        cache.insert("https://a.dev/?year=2020".to_string(), "a".to_string());
        cache.insert("https://a.dev/?year=2019&tweets=1".to_string(), "b".to_string());
        cache.insert("https://other.dev/?year=2020".to_string(), "c".to_string());

        let removed = cache.remove_origin("https://a.dev");
        assert_eq!(removed, 2);
        assert!(cache.get("https://a.dev/?year=2020").is_none());
        assert!(cache.get("https://a.dev/?year=2019&tweets=1").is_none());
        assert_eq!(cache.get("https://other.dev/?year=2020").as_deref(), Some("c"));
    }

    #[test]
    fn clear_empties_everything() {
        let cache = RenderCache::default();
        cache.insert("https://a.dev/".to_string(), "a".to_string());
        cache.insert("https://b.dev/".to_string(), "b".to_string());
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bounds_entries() {
        let cache = RenderCache::new(2);
        cache.insert("https://a.dev/1".to_string(), "1".to_string());
        cache.insert("https://a.dev/2".to_string(), "2".to_string());
        cache.insert("https://a.dev/3".to_string(), "3".to_string());

        assert!(cache.get("https://a.dev/1").is_none());
        assert!(cache.get("https://a.dev/2").is_some());
        assert!(cache.get("https://a.dev/3").is_some());
    }
}
