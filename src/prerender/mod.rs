//! Headless-Chrome prerendering.
//!
//! Produces fully populated HTML snapshots of the public page by executing
//! it in a real browser, with a URL-keyed render cache invalidated by store
//! changes rather than TTLs. See the submodules for the moving parts:
//! browser process management, request interception, asset inlining, the
//! cache itself and the orchestrating service.

mod browser;
mod cache;
mod inline;
mod intercept;
mod service;
mod watch;

pub use browser::{ChromeLease, ChromePool};
pub use cache::RenderCache;
pub use inline::{CapturedAssets, inline_html};
pub use intercept::{Disposition, InterceptPolicy, InterceptRules, ResourceKind};
pub use service::{PrerenderConfig, Prerenderer, RenderError, RenderOptions};
pub use watch::spawn_change_watcher;
