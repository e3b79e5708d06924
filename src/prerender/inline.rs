//! Sub-resource inlining.
//!
//! While a page renders, same-origin stylesheet and script bodies are
//! captured keyed by their absolute URL. After serialization the HTML is
//! rewritten so each `<link rel=stylesheet>` / `<script src>` with a
//! captured body becomes an inline `<style>` / `<script>`, removing a
//! render-blocking round trip from the snapshot. The rewrite happens
//! entirely outside the browser, so the spliced script text is never
//! executed a second time.

use dashmap::DashMap;
use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use thiserror::Error;
use url::{Origin, Url};

use super::intercept::ResourceKind;

#[derive(Debug, Error)]
#[error("inline rewrite failed: {0}")]
pub struct InlineError(String);

/// Response bodies captured during a single render. Only resources on the
/// target page's origin are kept; cross-origin payloads are never inlined.
pub struct CapturedAssets {
    origin: Origin,
    styles: DashMap<String, String>,
    scripts: DashMap<String, String>,
}

impl CapturedAssets {
    pub fn new(target: &Url) -> Self {
        Self {
            origin: target.origin(),
            styles: DashMap::new(),
            scripts: DashMap::new(),
        }
    }

    pub fn is_same_origin(&self, url: &str) -> bool {
        Url::parse(url)
            .map(|parsed| parsed.origin() == self.origin)
            .unwrap_or(false)
    }

    /// Record a response body. Ignored unless the URL is same-origin and the
    /// kind is one the inliner handles.
    pub fn record(&self, url: &str, kind: ResourceKind, body: String) {
        if !self.is_same_origin(url) {
            return;
        }
        match kind {
            ResourceKind::Stylesheet => {
                self.styles.insert(url.to_string(), body);
            }
            ResourceKind::Script => {
                self.scripts.insert(url.to_string(), body);
            }
            _ => {}
        }
    }

    pub fn style_for(&self, url: &str) -> Option<String> {
        self.styles.get(url).map(|body| body.clone())
    }

    pub fn script_for(&self, url: &str) -> Option<String> {
        self.scripts.get(url).map(|body| body.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty() && self.scripts.is_empty()
    }
}

/// Splice captured bodies into serialized HTML. Elements whose resource was
/// aborted, failed or cross-origin have no captured body and are left
/// untouched. Inline elements carry no `href`/`src`, so re-running the
/// rewrite over its own output is a no-op.
pub fn inline_html(
    html: &str,
    base: &Url,
    captured: &CapturedAssets,
    inline_styles: bool,
    inline_scripts: bool,
) -> Result<String, InlineError> {
    if !inline_styles && !inline_scripts {
        return Ok(html.to_string());
    }

    let mut handlers = Vec::new();

    if inline_styles {
        handlers.push(element!("link[rel=\"stylesheet\"]", move |el| {
            if let Some(href) = el.get_attribute("href")
                && let Some(resolved) = resolve(base, &href)
                && let Some(css) = captured.style_for(resolved.as_str())
            {
                el.replace(&format!("<style>{css}</style>"), ContentType::Html);
            }
            Ok(())
        }));
    }

    if inline_scripts {
        handlers.push(element!("script[src]", move |el| {
            if let Some(src) = el.get_attribute("src")
                && let Some(resolved) = resolve(base, &src)
                && let Some(js) = captured.script_for(resolved.as_str())
            {
                let markup = match el.get_attribute("type") {
                    Some(kind) => format!("<script type=\"{kind}\">{js}</script>"),
                    None => format!("<script>{js}</script>"),
                };
                el.replace(&markup, ContentType::Html);
            }
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| InlineError(err.to_string()))
}

fn resolve(base: &Url, href: &str) -> Option<Url> {
    base.join(href).ok()
}
