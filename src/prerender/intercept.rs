//! Per-request interception policy.
//!
//! Every sub-resource fetch a render performs is classified before the
//! network call proceeds: blocked URLs are aborted outright, the primary
//! stylesheet can be answered from a local minified copy, and when only
//! critical requests are wanted anything that cannot affect the serialized
//! DOM (images, media, fonts) is aborted as pure waste.

use std::sync::Arc;

/// Resource classification of an intercepted request, reduced to the kinds
/// the policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Script,
    Image,
    Media,
    Font,
    Xhr,
    Fetch,
    WebSocket,
    Other,
}

/// What to do with an intercepted request.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Let the request hit the network.
    PassThrough,
    /// Cancel the request before any network activity.
    Abort,
    /// Answer immediately with a local body instead of fetching.
    ServeLocal {
        body: Arc<String>,
        content_type: &'static str,
    },
}

/// Per-render toggles the policy consults.
#[derive(Debug, Clone, Copy)]
pub struct InterceptRules {
    pub only_critical_requests: bool,
    pub inline_styles: bool,
}

pub struct InterceptPolicy {
    blocked_url_patterns: Vec<String>,
    stylesheet_suffix: String,
    stylesheet_body: Option<Arc<String>>,
}

impl InterceptPolicy {
    pub fn new(
        blocked_url_patterns: Vec<String>,
        stylesheet_suffix: String,
        stylesheet_body: Option<String>,
    ) -> Self {
        Self {
            blocked_url_patterns,
            stylesheet_suffix,
            stylesheet_body: stylesheet_body.map(Arc::new),
        }
    }

    pub fn decide(&self, url: &str, kind: ResourceKind, rules: InterceptRules) -> Disposition {
        if self.is_blocked(url) {
            return Disposition::Abort;
        }

        // Stylesheet responses are needed when inlining; the site's own
        // stylesheet is answered from the preloaded minified copy so the
        // render never depends on the static file route.
        if rules.inline_styles
            && url.ends_with(&self.stylesheet_suffix)
            && let Some(body) = &self.stylesheet_body
        {
            return Disposition::ServeLocal {
                body: Arc::clone(body),
                content_type: "text/css",
            };
        }

        if rules.only_critical_requests && !is_critical(kind, rules.inline_styles) {
            return Disposition::Abort;
        }

        Disposition::PassThrough
    }

    fn is_blocked(&self, url: &str) -> bool {
        self.blocked_url_patterns
            .iter()
            .any(|pattern| url.contains(pattern))
    }
}

fn is_critical(kind: ResourceKind, inline_styles: bool) -> bool {
    match kind {
        ResourceKind::Document
        | ResourceKind::Script
        | ResourceKind::Xhr
        | ResourceKind::Fetch
        | ResourceKind::WebSocket => true,
        ResourceKind::Stylesheet => inline_styles,
        ResourceKind::Image
        | ResourceKind::Media
        | ResourceKind::Font
        | ResourceKind::Other => false,
    }
}
