//! Render orchestration.
//!
//! `Prerenderer::render` is the public entry point: consult the cache, and
//! on a miss acquire a browser, wire interception and body capture, navigate
//! with the render marker appended, wait for the page's readiness signal,
//! serialize, inline, write the cache and release the browser. Any process
//! failure between acquisition and readiness tears down the shared browser
//! and surfaces an error; a partial snapshot is never returned and no retry
//! happens here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams, FulfillRequestParams, HeaderEntry,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, ErrorReason, EventLoadingFinished,
    EventResponseReceived, GetResponseBodyParams, RequestId as NetworkRequestId, ResourceType,
};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use super::browser::{ChromeLease, ChromePool};
use super::cache::RenderCache;
use super::inline::{CapturedAssets, InlineError, inline_html};
use super::intercept::{Disposition, InterceptPolicy, InterceptRules, ResourceKind};

/// Marker query parameter appended to the navigated URL so in-page code can
/// tell it is being snapshotted and skip behavior that makes no sense there
/// (realtime subscriptions, analytics beacons). Never part of the cache key.
const RENDER_MARKER_PARAM: &str = "headless";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("failed to connect to browser at `{endpoint}`: {detail}")]
    Connect { endpoint: String, detail: String },
    #[error("navigation to `{url}` timed out after {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },
    #[error("readiness selector `{selector}` did not appear within {timeout_ms}ms")]
    ReadyTimeout { selector: String, timeout_ms: u64 },
    #[error("browser protocol error: {0}")]
    Protocol(#[from] chromiumoxide::error::CdpError),
    #[error(transparent)]
    Inline(#[from] InlineError),
    #[error("invalid render url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Per-call rendering options.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Consult (and on success populate) the render cache.
    pub use_cache: bool,
    /// Abort sub-resource fetches that cannot affect the serialized DOM.
    pub only_critical_requests: bool,
    pub inline_styles: bool,
    pub inline_scripts: bool,
    /// Keep the launched browser alive for later calls.
    pub reuse_chrome: bool,
    /// Display mode for a newly launched browser; ignored when an existing
    /// or reused process is involved.
    pub headless: bool,
    /// DevTools websocket endpoint of a caller-owned browser. Takes
    /// precedence over `reuse_chrome`/`headless`; never closed by the pool.
    pub existing_endpoint: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            only_critical_requests: true,
            inline_styles: true,
            inline_scripts: true,
            reuse_chrome: false,
            headless: true,
            existing_endpoint: None,
        }
    }
}

impl RenderOptions {
    /// Options from the routing layer's query-string toggles: the presence
    /// of each key flips the matching boolean away from its default.
    pub fn from_query_toggles(query: &HashMap<String, String>) -> Self {
        let mut options = Self::default();
        if query.contains_key("nocache") {
            options.use_cache = false;
        }
        if query.contains_key("noinline") {
            options.inline_styles = false;
            options.inline_scripts = false;
        }
        if query.contains_key("noreduce") {
            options.only_critical_requests = false;
        }
        if query.contains_key("reusechrome") {
            options.reuse_chrome = true;
        }
        if query.contains_key("noheadless") {
            options.headless = false;
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct PrerenderConfig {
    /// Element whose presence marks client-side population as complete.
    pub ready_selector: String,
    pub navigation_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub cache_capacity: usize,
    pub blocked_url_patterns: Vec<String>,
    /// Requests ending in this suffix are answered from `stylesheet_body`.
    pub stylesheet_suffix: String,
    pub stylesheet_body: Option<String>,
    pub chrome_args: Vec<String>,
}

impl Default for PrerenderConfig {
    fn default() -> Self {
        Self {
            ready_selector: "#posts".to_string(),
            navigation_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(15),
            ready_poll_interval: Duration::from_millis(100),
            cache_capacity: super::cache::DEFAULT_CAPACITY,
            blocked_url_patterns: vec!["/gtag/js".to_string()],
            stylesheet_suffix: "styles.css".to_string(),
            stylesheet_body: None,
            chrome_args: Vec::new(),
        }
    }
}

pub struct Prerenderer {
    config: PrerenderConfig,
    cache: RenderCache,
    pool: ChromePool,
    policy: Arc<InterceptPolicy>,
    // Per-key render gate; concurrent misses for the same URL serialize and
    // the laggard re-checks the cache instead of rendering again.
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Prerenderer {
    pub fn new(config: PrerenderConfig) -> Self {
        let cache = RenderCache::new(config.cache_capacity);
        let pool = ChromePool::new(config.chrome_args.clone());
        let policy = Arc::new(InterceptPolicy::new(
            config.blocked_url_patterns.clone(),
            config.stylesheet_suffix.clone(),
            config.stylesheet_body.clone(),
        ));
        Self {
            config,
            cache,
            pool,
            policy,
            in_flight: DashMap::new(),
        }
    }

    /// Render `url` to serialized HTML. The cache key is `url` exactly as
    /// given; callers decide which query parameters belong in it.
    pub async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, RenderError> {
        let target = Url::parse(url)?;
        let key = url.to_string();

        if options.use_cache
            && let Some(html) = self.cache.get(&key)
        {
            debug!(target = "rassegna::prerender", url, "serving cached render");
            return Ok(html);
        }

        let gate = self.in_flight.entry(key.clone()).or_default().clone();
        let _guard = gate.lock().await;

        // A concurrent render may have landed while waiting on the gate.
        if options.use_cache
            && let Some(html) = self.cache.get(&key)
        {
            return Ok(html);
        }

        counter!("rassegna_render_total").increment(1);
        let started = Instant::now();
        let lease = self.pool.acquire(options).await?;

        match self.render_with(&lease, &target, options).await {
            Ok(html) => {
                self.pool.release(lease).await;
                // A forced refresh still repopulates the cache.
                self.cache.insert(key, html.clone());
                let elapsed_ms = started.elapsed().as_millis() as u64;
                histogram!("rassegna_render_duration_ms").record(elapsed_ms as f64);
                info!(
                    target = "rassegna::prerender",
                    url, elapsed_ms, "headless render complete"
                );
                Ok(html)
            }
            Err(err) => {
                counter!("rassegna_render_failure_total").increment(1);
                self.pool.discard(lease).await;
                warn!(
                    target = "rassegna::prerender",
                    url,
                    error = %err,
                    "headless render failed"
                );
                Err(err)
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
        info!(target = "rassegna::prerender", "render cache cleared");
    }

    /// Drop every cached render whose key starts with `origin`.
    pub fn invalidate_origin(&self, origin: &str) -> usize {
        let removed = self.cache.remove_origin(origin);
        info!(
            target = "rassegna::prerender",
            origin, removed, "render cache invalidated by origin"
        );
        removed
    }

    pub fn invalidate_url(&self, url: &str) -> bool {
        self.cache.remove(url)
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    /// Endpoint of the shared reused browser, if one is currently alive.
    pub async fn shared_endpoint(&self) -> Option<String> {
        self.pool.shared_endpoint().await
    }

    async fn render_with(
        &self,
        lease: &ChromeLease,
        target: &Url,
        options: &RenderOptions,
    ) -> Result<String, RenderError> {
        let page = lease.browser().new_page("about:blank").await?;
        let outcome = self.drive(&page, target, options).await;
        if let Err(err) = page.close().await {
            debug!(
                target = "rassegna::prerender",
                error = %err,
                "closing render page failed"
            );
        }
        outcome
    }

    async fn drive(
        &self,
        page: &Page,
        target: &Url,
        options: &RenderOptions,
    ) -> Result<String, RenderError> {
        let rules = InterceptRules {
            only_critical_requests: options.only_critical_requests,
            inline_styles: options.inline_styles,
        };
        let inline_wanted = options.inline_styles || options.inline_scripts;
        let captured = Arc::new(CapturedAssets::new(target));

        // Interception and capture attach before navigation starts; a
        // listener registered later would miss the earliest requests.
        page.execute(NetworkEnableParams::default()).await?;
        page.execute(FetchEnableParams::default()).await?;
        let requests = page.event_listener::<EventRequestPaused>().await?;
        let responses = page.event_listener::<EventResponseReceived>().await?;
        let finished = page.event_listener::<EventLoadingFinished>().await?;

        let _intercept = TaskGuard(tokio::spawn(drive_interception(
            page.clone(),
            requests,
            Arc::clone(&self.policy),
            rules,
        )));
        let _capture = inline_wanted.then(|| {
            TaskGuard(tokio::spawn(drive_capture(
                page.clone(),
                responses,
                finished,
                Arc::clone(&captured),
            )))
        });

        let nav_url = with_render_marker(target);
        let nav_timeout = self.config.navigation_timeout;
        timeout(nav_timeout, page.goto(nav_url.as_str()))
            .await
            .map_err(|_| RenderError::NavigationTimeout {
                url: target.to_string(),
                timeout_ms: nav_timeout.as_millis() as u64,
            })??;

        self.wait_for_ready(page).await?;

        let html = page.content().await?;
        if inline_wanted {
            return Ok(inline_html(
                &html,
                target,
                &captured,
                options.inline_styles,
                options.inline_scripts,
            )?);
        }
        Ok(html)
    }

    async fn wait_for_ready(&self, page: &Page) -> Result<(), RenderError> {
        let selector = self.config.ready_selector.as_str();
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RenderError::ReadyTimeout {
                    selector: selector.to_string(),
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                });
            }
            sleep(self.config.ready_poll_interval).await;
        }
    }
}

/// Answer every paused request with its disposition. Runs until the page's
/// event stream closes or the render completes.
async fn drive_interception(
    page: Page,
    mut events: impl Stream<Item = Arc<EventRequestPaused>> + Unpin,
    policy: Arc<InterceptPolicy>,
    rules: InterceptRules,
) {
    while let Some(event) = events.next().await {
        let kind = resource_kind(&event.resource_type);
        let delivered = match policy.decide(&event.request.url, kind, rules) {
            Disposition::PassThrough => page
                .execute(ContinueRequestParams::new(event.request_id.clone()))
                .await
                .map(drop),
            Disposition::Abort => page
                .execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::BlockedByClient,
                ))
                .await
                .map(drop),
            Disposition::ServeLocal { body, content_type } => {
                match FulfillRequestParams::builder()
                    .request_id(event.request_id.clone())
                    .response_code(200)
                    .response_headers(vec![HeaderEntry {
                        name: "content-type".to_string(),
                        value: content_type.to_string(),
                    }])
                    .body(BASE64.encode(body.as_bytes()))
                    .build()
                {
                    Ok(params) => page.execute(params).await.map(drop),
                    Err(detail) => {
                        debug!(
                            target = "rassegna::prerender",
                            detail, "building fulfill response failed"
                        );
                        Ok(())
                    }
                }
            }
        };
        if let Err(err) = delivered {
            debug!(
                target = "rassegna::prerender",
                url = %event.request.url,
                error = %err,
                "request disposition not delivered"
            );
        }
    }
}

/// Track same-origin stylesheet/script responses and pull their bodies once
/// loading finishes. An individual body that cannot be fetched just leaves
/// its element un-inlined.
async fn drive_capture(
    page: Page,
    mut responses: impl Stream<Item = Arc<EventResponseReceived>> + Unpin,
    mut finished: impl Stream<Item = Arc<EventLoadingFinished>> + Unpin,
    captured: Arc<CapturedAssets>,
) {
    let mut pending: HashMap<NetworkRequestId, (String, ResourceKind)> = HashMap::new();
    loop {
        tokio::select! {
            response = responses.next() => match response {
                Some(event) => {
                    let kind = resource_kind(&event.r#type);
                    if matches!(kind, ResourceKind::Stylesheet | ResourceKind::Script)
                        && captured.is_same_origin(&event.response.url)
                    {
                        pending.insert(
                            event.request_id.clone(),
                            (event.response.url.clone(), kind),
                        );
                    }
                }
                None => break,
            },
            done = finished.next() => match done {
                Some(event) => {
                    let Some((url, kind)) = pending.remove(&event.request_id) else {
                        continue;
                    };
                    match page
                        .execute(GetResponseBodyParams::new(event.request_id.clone()))
                        .await
                    {
                        Ok(body) => {
                            let text = if body.base64_encoded {
                                BASE64
                                    .decode(body.body.as_bytes())
                                    .ok()
                                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                            } else {
                                Some(body.body.clone())
                            };
                            if let Some(text) = text {
                                captured.record(&url, kind, text);
                            }
                        }
                        Err(err) => debug!(
                            target = "rassegna::prerender",
                            url = %url,
                            error = %err,
                            "response body unavailable"
                        ),
                    }
                }
                None => break,
            },
        }
    }
}

fn resource_kind(resource_type: &ResourceType) -> ResourceKind {
    match resource_type {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Media => ResourceKind::Media,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        ResourceType::WebSocket => ResourceKind::WebSocket,
        _ => ResourceKind::Other,
    }
}

fn with_render_marker(url: &Url) -> Url {
    let mut marked = url.clone();
    marked
        .query_pairs_mut()
        .append_pair(RENDER_MARKER_PARAM, "");
    marked
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_appended_to_navigation_url_only() {
        let target = Url::parse("https://a.dev/?year=2020").expect("valid url");
        let marked = with_render_marker(&target);
        assert_eq!(marked.as_str(), "https://a.dev/?year=2020&headless=");
        // The original is untouched; cache keys never see the marker.
        assert_eq!(target.as_str(), "https://a.dev/?year=2020");
    }

    #[test]
    fn query_toggles_flip_defaults() {
        let defaults = RenderOptions::default();
        assert!(defaults.use_cache);
        assert!(defaults.only_critical_requests);
        assert!(defaults.inline_styles);
        assert!(defaults.inline_scripts);
        assert!(!defaults.reuse_chrome);
        assert!(defaults.headless);

        let mut query = HashMap::new();
        for key in ["nocache", "noinline", "noreduce", "reusechrome", "noheadless"] {
            query.insert(key.to_string(), String::new());
        }
        let flipped = RenderOptions::from_query_toggles(&query);
        assert!(!flipped.use_cache);
        assert!(!flipped.inline_styles);
        assert!(!flipped.inline_scripts);
        assert!(!flipped.only_critical_requests);
        assert!(flipped.reuse_chrome);
        assert!(!flipped.headless);
    }

    #[tokio::test]
    async fn cache_hit_returns_without_a_browser() {
        let prerenderer = Prerenderer::new(PrerenderConfig::default());
        prerenderer
            .cache()
            .insert("https://a.dev/?year=2020".to_string(), "<html>cached</html>".to_string());

        let html = prerenderer
            .render("https://a.dev/?year=2020", &RenderOptions::default())
            .await
            .expect("cached render");
        assert_eq!(html, "<html>cached</html>");

        // And twice in a row stays byte-identical.
        let again = prerenderer
            .render("https://a.dev/?year=2020", &RenderOptions::default())
            .await
            .expect("cached render");
        assert_eq!(html, again);
    }

    #[tokio::test]
    async fn origin_invalidation_forces_a_fresh_render() {
        let prerenderer = Prerenderer::new(PrerenderConfig::default());
        prerenderer
            .cache()
            .insert("https://a.dev/?year=2020".to_string(), "stale".to_string());

        let removed = prerenderer.invalidate_origin("https://a.dev");
        assert_eq!(removed, 1);
        assert!(prerenderer.cache().get("https://a.dev/?year=2020").is_none());
    }

    #[test]
    fn resource_kinds_map_to_policy_kinds() {
        assert_eq!(
            resource_kind(&ResourceType::Document),
            ResourceKind::Document
        );
        assert_eq!(resource_kind(&ResourceType::Image), ResourceKind::Image);
        assert_eq!(
            resource_kind(&ResourceType::WebSocket),
            ResourceKind::WebSocket
        );
        assert_eq!(resource_kind(&ResourceType::Ping), ResourceKind::Other);
    }
}
