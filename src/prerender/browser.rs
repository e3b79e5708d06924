//! Chrome process management.
//!
//! The pool owns at most one long-lived "shared default" Chrome: the first
//! render asking for reuse launches it and records its DevTools websocket
//! endpoint; later renders reconnect to that endpoint with their own CDP
//! session. Callers can instead hand in the endpoint of a process they own,
//! which is attached to but never tracked or closed. A render failure
//! attributable to the process tears the shared default down so the next
//! acquire starts from a clean launch; a hung Chrome is assumed
//! unrecoverable.

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::service::{RenderError, RenderOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseKind {
    /// Connected to a caller-supplied process; the caller owns its lifecycle.
    Existing,
    /// Connected to (or just launched) the pool's shared default process.
    SharedReuse,
    /// Launched solely for this render; closed when the render ends.
    Fresh,
}

/// A render's handle on a browser. Every lease holds an independent CDP
/// connection plus the task draining its event stream.
pub struct ChromeLease {
    browser: Browser,
    driver: JoinHandle<()>,
    kind: LeaseKind,
}

impl ChromeLease {
    pub fn browser(&self) -> &Browser {
        &self.browser
    }
}

struct SharedChrome {
    browser: Browser,
    driver: JoinHandle<()>,
    endpoint: String,
}

pub struct ChromePool {
    shared: Mutex<Option<SharedChrome>>,
    chrome_args: Vec<String>,
}

impl ChromePool {
    pub fn new(chrome_args: Vec<String>) -> Self {
        Self {
            shared: Mutex::new(None),
            chrome_args,
        }
    }

    pub async fn acquire(&self, options: &RenderOptions) -> Result<ChromeLease, RenderError> {
        if let Some(endpoint) = &options.existing_endpoint {
            debug!(
                target = "rassegna::prerender",
                endpoint = %endpoint,
                "attaching to caller-supplied chrome"
            );
            let (browser, driver) = connect(endpoint).await?;
            return Ok(ChromeLease {
                browser,
                driver,
                kind: LeaseKind::Existing,
            });
        }

        if options.reuse_chrome {
            let mut shared = self.shared.lock().await;

            if let Some(existing) = shared.as_ref() {
                match connect(&existing.endpoint).await {
                    Ok((browser, driver)) => {
                        debug!(
                            target = "rassegna::prerender",
                            endpoint = %existing.endpoint,
                            "reusing previously launched chrome"
                        );
                        return Ok(ChromeLease {
                            browser,
                            driver,
                            kind: LeaseKind::SharedReuse,
                        });
                    }
                    Err(err) => {
                        warn!(
                            target = "rassegna::prerender",
                            endpoint = %existing.endpoint,
                            error = %err,
                            "shared chrome unreachable, relaunching"
                        );
                        if let Some(broken) = shared.take() {
                            close_shared(broken).await;
                        }
                    }
                }
            }

            let (browser, driver) = self.launch(options.headless).await?;
            let endpoint = browser.websocket_address().to_string();
            *shared = Some(SharedChrome {
                browser,
                driver,
                endpoint: endpoint.clone(),
            });
            drop(shared);

            let (browser, driver) = connect(&endpoint).await?;
            return Ok(ChromeLease {
                browser,
                driver,
                kind: LeaseKind::SharedReuse,
            });
        }

        let (browser, driver) = self.launch(options.headless).await?;
        Ok(ChromeLease {
            browser,
            driver,
            kind: LeaseKind::Fresh,
        })
    }

    /// Return a lease after a successful render. Shared and caller-owned
    /// processes stay alive; a fresh single-render process is closed.
    pub async fn release(&self, lease: ChromeLease) {
        let ChromeLease {
            mut browser,
            driver,
            kind,
        } = lease;
        if kind == LeaseKind::Fresh
            && let Err(err) = browser.close().await
        {
            debug!(
                target = "rassegna::prerender",
                error = %err,
                "closing single-render chrome failed"
            );
        }
        driver.abort();
    }

    /// Dispose of a lease after a render failure. The connection (and any
    /// process this render launched) is torn down, and the shared default is
    /// cleared unconditionally: the process behind it may be wedged, and the
    /// next acquire must start fresh.
    pub async fn discard(&self, lease: ChromeLease) {
        let ChromeLease {
            mut browser,
            driver,
            kind,
        } = lease;
        if kind != LeaseKind::Existing
            && let Err(err) = browser.close().await
        {
            debug!(
                target = "rassegna::prerender",
                error = %err,
                "closing failed chrome session"
            );
        }
        driver.abort();
        self.invalidate().await;
    }

    /// Drop the shared default process, closing it if present.
    pub async fn invalidate(&self) {
        let mut shared = self.shared.lock().await;
        if let Some(broken) = shared.take() {
            info!(
                target = "rassegna::prerender",
                endpoint = %broken.endpoint,
                "discarding shared chrome"
            );
            close_shared(broken).await;
        }
    }

    /// Endpoint of the shared default process, if one is alive.
    pub async fn shared_endpoint(&self) -> Option<String> {
        self.shared
            .lock()
            .await
            .as_ref()
            .map(|shared| shared.endpoint.clone())
    }

    async fn launch(&self, headless: bool) -> Result<(Browser, JoinHandle<()>), RenderError> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        builder = builder.arg("--disable-dev-shm-usage");
        for arg in &self.chrome_args {
            builder = builder.arg(arg);
        }
        let config = builder.build().map_err(RenderError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| RenderError::Launch(err.to_string()))?;
        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        counter!("rassegna_chrome_launch_total").increment(1);
        info!(target = "rassegna::prerender", headless, "launched chrome");
        Ok((browser, driver))
    }
}

async fn connect(endpoint: &str) -> Result<(Browser, JoinHandle<()>), RenderError> {
    let (browser, mut handler) =
        Browser::connect(endpoint)
            .await
            .map_err(|err| RenderError::Connect {
                endpoint: endpoint.to_string(),
                detail: err.to_string(),
            })?;
    let driver = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });
    Ok((browser, driver))
}

async fn close_shared(mut shared: SharedChrome) {
    if let Err(err) = shared.browser.close().await {
        debug!(
            target = "rassegna::prerender",
            error = %err,
            "closing shared chrome failed"
        );
    }
    shared.driver.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_starts_without_a_shared_process() {
        let pool = ChromePool::new(Vec::new());
        assert!(pool.shared_endpoint().await.is_none());
        // Invalidating an empty pool is a no-op.
        pool.invalidate().await;
        assert!(pool.shared_endpoint().await.is_none());
    }

    #[tokio::test]
    async fn connecting_to_a_dead_endpoint_errors() {
        let err = connect("ws://127.0.0.1:1/devtools/browser/gone")
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, RenderError::Connect { .. }));
    }
}
