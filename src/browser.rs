use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EventExceptionThrown;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AutomationError;

const LAUNCH_ATTEMPTS: u32 = 3;
const LAUNCH_RETRY_DELAYS_MS: [u64; 2] = [2_000, 5_000];
const NAVIGATE_SETTLE_MS: u64 = 1_500;
const SCREENSHOT_JPEG_QUALITY: i64 = 70;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct BrowserVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

/// Owns one browser process and exactly one page.
///
/// Either both fields are populated or both are empty; a launch that gets a
/// process but no page tears the process down before reporting failure.
pub struct BrowserHandle {
    browser: Mutex<Option<Browser>>,
    page: Mutex<Option<Page>>,
    /// Cleared by the CDP event loop when the connection drops.
    alive: Arc<AtomicBool>,
    /// Set by the first `close()` caller; later callers no-op.
    closing: AtomicBool,
    /// Attached to an external browser over CDP instead of owning the
    /// process; close disconnects without killing anything.
    attached: bool,
    screenshots: bool,
}

impl BrowserHandle {
    /// Start a browser and open its page, retrying the whole sequence up
    /// to the attempt budget. Each attempt is independent.
    pub async fn launch(config: &Config) -> Result<Self, AutomationError> {
        let mut last_err = String::from("no attempt made");
        for attempt in 1..=LAUNCH_ATTEMPTS {
            let result = match config.remote_debugging_port {
                Some(port) => Self::try_attach(port, config).await,
                None => Self::try_launch(config).await,
            };
            match result {
                Ok(handle) => {
                    info!(attempt, "browser ready");
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(attempt, "browser start failed: {e:#}");
                    last_err = format!("{e:#}");
                }
            }
            if attempt < LAUNCH_ATTEMPTS {
                let delay = LAUNCH_RETRY_DELAYS_MS[(attempt - 1) as usize];
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Err(AutomationError::Launch { detail: last_err })
    }

    async fn try_launch(config: &Config) -> anyhow::Result<Self> {
        let mut builder = BrowserConfig::builder()
            .window_size(1280, 900)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--mute-audio")
            .arg("--hide-scrollbars")
            .arg(format!("--user-agent={USER_AGENT}"));
        if !config.headless() {
            builder = builder.with_head();
        }
        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder
            .build()
            .map_err(|e| anyhow!("browser config: {e}"))?;

        let (browser, handler) = Browser::launch(browser_config)
            .await
            .context("failed to start browser process")?;
        let alive = spawn_event_loop(handler);

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                // process is up but no page: tear down, never hand out a
                // half-initialized handle
                let mut browser = browser;
                let _ = browser.close().await;
                let _ = browser.kill().await;
                return Err(anyhow!("failed to open page: {e}"));
            }
        };
        wire_page_logging(&page).await;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page: Mutex::new(Some(page)),
            alive,
            closing: AtomicBool::new(false),
            attached: false,
            screenshots: config.screenshots(),
        })
    }

    async fn try_attach(port: u16, config: &Config) -> anyhow::Result<Self> {
        let url = format!("http://127.0.0.1:{port}/json/version");
        let resp: BrowserVersion = reqwest::get(&url)
            .await
            .context(format!("failed to reach browser on port {port}"))?
            .json()
            .await?;

        let (mut browser, handler) = Browser::connect(&resp.ws_url)
            .await
            .context("failed to connect to browser via WebSocket")?;
        let alive = spawn_event_loop(handler);

        // pages that were open before we connected
        browser.fetch_targets().await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let page = match first_or_new_page(&browser).await {
            Ok(page) => page,
            Err(e) => {
                drop(browser);
                return Err(e);
            }
        };
        wire_page_logging(&page).await;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page: Mutex::new(Some(page)),
            alive,
            closing: AtomicBool::new(false),
            attached: true,
            screenshots: config.screenshots(),
        })
    }

    /// The one page this handle drives. `None` after close.
    pub async fn page(&self) -> Option<Page> {
        self.page.lock().await.clone()
    }

    /// Best-effort navigation: waits for the DOM-ready signal plus a short
    /// settle, reports `false` on any error rather than raising. Non-2xx
    /// outcomes are not distinguished from success, only reachability of
    /// a ready DOM.
    pub async fn navigate(&self, url: &str) -> bool {
        let Some(page) = self.page().await else {
            return false;
        };
        let result = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                tokio::time::sleep(Duration::from_millis(NAVIGATE_SETTLE_MS)).await;
                true
            }
            Err(e) => {
                warn!("navigation to {url} failed: {e:#}");
                false
            }
        }
    }

    /// Capture the viewport as JPEG. No-ops when screenshots are disabled;
    /// capture or write errors are logged and swallowed.
    pub async fn screenshot(&self, path: &Path) {
        if !self.screenshots {
            return;
        }
        let Some(page) = self.page().await else {
            return;
        };
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(SCREENSHOT_JPEG_QUALITY)
            .build();
        match page.screenshot(params).await {
            Ok(bytes) => {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                match tokio::fs::write(path, &bytes).await {
                    Ok(()) => debug!(path = %path.display(), "screenshot written"),
                    Err(e) => warn!("failed to write screenshot: {e}"),
                }
            }
            Err(e) => warn!("screenshot capture failed: {e}"),
        }
    }

    /// Whether the CDP connection still reports itself live. Consumed by
    /// the liveness reaper only; request paths rely on call failures.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    /// Whether a close has been requested on this handle.
    pub fn close_requested(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Idempotent teardown. A concurrent or repeated call while one is in
    /// flight returns immediately. Graceful shutdown first; an
    /// already-disconnected browser is not an error, anything else
    /// escalates to a force-kill. Handle state is empty on every exit path.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("close already in progress");
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.page.lock().await.take();
        let browser = self.browser.lock().await.take();
        let Some(mut browser) = browser else {
            return;
        };
        if self.attached {
            debug!("detaching from external browser");
            drop(browser);
            return;
        }
        match browser.close().await {
            Ok(_) => {
                let _ = browser.wait().await;
                info!("browser closed");
            }
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("closed") || msg.contains("disconnect") || msg.contains("not connected")
                {
                    debug!("browser already disconnected: {e}");
                } else {
                    warn!("graceful close failed, killing process: {e}");
                    let _ = browser.kill().await;
                }
            }
        }
    }

    // ---- page helpers ------------------------------------------------

    /// Run a JS expression whose result is a JSON-encoded string, decode
    /// it. Any failure along the way reads as `None`.
    pub async fn evaluate_json<T: DeserializeOwned>(&self, script: &str) -> Option<T> {
        let page = self.page().await?;
        let result = page.evaluate(script).await.ok()?;
        let raw = result.into_value::<String>().ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn evaluate_bool(&self, script: &str) -> bool {
        let Some(page) = self.page().await else {
            return false;
        };
        page.evaluate(script)
            .await
            .ok()
            .and_then(|r| r.into_value::<bool>().ok())
            .unwrap_or(false)
    }

    pub async fn evaluate_string(&self, script: &str) -> Option<String> {
        let page = self.page().await?;
        page.evaluate(script).await.ok()?.into_value::<String>().ok()
    }

    pub async fn current_url(&self) -> Option<String> {
        let page = self.page().await?;
        page.url().await.ok().flatten()
    }

    /// Whether any element matches `selector` right now.
    pub async fn selector_exists(&self, selector: &str) -> bool {
        let script = format!("document.querySelector('{selector}') !== null");
        self.evaluate_bool(&script).await
    }

    /// Poll for the first candidate to appear, 300ms intervals, bounded
    /// total wait. Returns the selector that matched.
    pub async fn wait_for_any<'a>(
        &self,
        candidates: &[&'a str],
        timeout: Duration,
    ) -> Option<&'a str> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for sel in candidates {
                if self.selector_exists(sel).await {
                    return Some(sel);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    }

    /// Click the first element matching `selector`, then sleep `settle_ms`.
    /// Returns whether an element was found and clicked.
    pub async fn click_selector(&self, selector: &str, settle_ms: u64) -> bool {
        let script = format!(
            r#"
            (() => {{
                const el = document.querySelector('{selector}');
                if (!el) return false;
                el.click();
                return true;
            }})()
            "#
        );
        let clicked = self.evaluate_bool(&script).await;
        if clicked && settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        }
        clicked
    }

    /// Type into the currently focused element using CDP.
    pub async fn type_text(&self, text: &str) -> bool {
        let Some(page) = self.page().await else {
            return false;
        };
        let Ok(params) = InsertTextParams::builder().text(text).build() else {
            return false;
        };
        match page.execute(params).await {
            Ok(_) => true,
            Err(e) => {
                warn!("typing failed: {e}");
                false
            }
        }
    }

    /// Dispatch a keydown for `key` at the document level, then sleep
    /// `settle_ms`. For letters pass lowercase; for special keys the key
    /// name ("Enter", "Escape", "End", "PageDown").
    pub async fn press_key(&self, key: &str, settle_ms: u64) {
        let code = if key.len() == 1 && key.chars().all(|c| c.is_ascii_lowercase()) {
            format!("Key{}", key.to_uppercase())
        } else {
            key.to_string()
        };
        let script = format!(
            "document.dispatchEvent(new KeyboardEvent('keydown', \
             {{ key: '{key}', code: '{code}', bubbles: true }}))"
        );
        if let Some(page) = self.page().await {
            if let Err(e) = page.evaluate(script).await {
                debug!("key dispatch failed: {e}");
            }
        }
        if settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        }
    }

    /// Handle with no underlying browser, for exercising the close/liveness
    /// bookkeeping without a process.
    #[cfg(test)]
    pub(crate) fn unlaunched() -> Self {
        Self {
            browser: Mutex::new(None),
            page: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
            attached: false,
            screenshots: false,
        }
    }
}

/// Drain CDP events in the background, logging errors only. The returned
/// flag flips to false when the event stream ends, which is how the
/// liveness reaper learns the connection died.
fn spawn_event_loop(mut handler: chromiumoxide::handler::Handler) -> Arc<AtomicBool> {
    let alive = Arc::new(AtomicBool::new(true));
    let flag = alive.clone();
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("cdp event error: {e}");
            }
        }
        flag.store(false, Ordering::SeqCst);
        debug!("cdp event stream ended");
    });
    alive
}

/// Page-level JS exceptions go to logging only, never to callers.
async fn wire_page_logging(page: &Page) {
    if let Ok(mut exceptions) = page.event_listener::<EventExceptionThrown>().await {
        tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                debug!("page exception: {}", event.exception_details.text);
            }
        });
    }
}

async fn first_or_new_page(browser: &Browser) -> anyhow::Result<Page> {
    let pages = browser.pages().await?;
    match pages.into_iter().next() {
        Some(page) => Ok(page),
        None => browser
            .new_page("about:blank")
            .await
            .context("no existing page and failed to open one"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let handle = BrowserHandle::unlaunched();
        assert!(!handle.close_requested());
        handle.close().await;
        assert!(handle.close_requested());
        // second call observes the in-progress flag and returns
        handle.close().await;
        assert!(handle.close_requested());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn concurrent_close_runs_one_teardown() {
        let handle = Arc::new(BrowserHandle::unlaunched());
        let a = {
            let h = handle.clone();
            tokio::spawn(async move { h.close().await })
        };
        let b = {
            let h = handle.clone();
            tokio::spawn(async move { h.close().await })
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok() && rb.is_ok());
        assert!(handle.close_requested());
    }

    #[tokio::test]
    async fn helpers_degrade_without_a_page() {
        let handle = BrowserHandle::unlaunched();
        assert!(!handle.navigate("https://example.com").await);
        assert!(!handle.selector_exists("body").await);
        assert!(!handle.click_selector("body", 0).await);
        assert!(!handle.type_text("x").await);
        assert!(handle.current_url().await.is_none());
        assert!(
            handle
                .wait_for_any(&["body"], Duration::from_millis(10))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn screenshot_noops_when_disabled() {
        let handle = BrowserHandle::unlaunched();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shot.jpg");
        handle.screenshot(&path).await;
        assert!(!path.exists());
    }
}
