//! Browser capability traits
//!
//! The core drives a real browser only through [`PageHandle`] and
//! [`BrowserHandle`]. Navigation and screenshots are native driver calls; DOM
//! queries and interactions go through injected JavaScript, so any driver
//! that can evaluate an expression can host the pipeline. [`cdp`] is the
//! chromiumoxide-backed production implementation; tests script their own.

pub mod cdp;
pub mod js;
pub mod xpath;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SpiderError, SpiderResult};

/// One browser page (tab)
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Stable identity within the browser session, used to spot new tabs
    fn id(&self) -> String;

    async fn goto(&self, url: &str, timeout: Duration) -> SpiderResult<()>;

    async fn current_url(&self) -> SpiderResult<String>;

    /// Evaluate a JS expression and return its JSON value
    async fn evaluate(&self, js: &str) -> SpiderResult<Value>;

    /// Viewport screenshot as PNG bytes
    async fn screenshot(&self) -> SpiderResult<Vec<u8>>;

    async fn go_back(&self, timeout: Duration) -> SpiderResult<()>;

    async fn close(&self) -> SpiderResult<()>;

    async fn is_closed(&self) -> bool;

    /// Scroll the viewport by pixel deltas
    async fn scroll_by(&self, dx: f64, dy: f64) -> SpiderResult<()> {
        self.evaluate(&format!("window.scrollBy({dx}, {dy})")).await?;
        Ok(())
    }

    /// Dispatch a key press to the focused element
    async fn keyboard_press(&self, key: &str) -> SpiderResult<()> {
        let payload = serde_json::to_string(key)
            .map_err(|e| SpiderError::Browser(format!("key encode: {e}")))?;
        self.evaluate(&js::press_key_script(&payload)).await?;
        Ok(())
    }

    /// Full HTML of the page
    async fn content(&self) -> SpiderResult<String> {
        let value = self
            .evaluate("document.documentElement.outerHTML")
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SpiderError::Browser("content was not a string".into()))
    }

    /// Visible text of the whole page, for innerText hit-checks
    async fn inner_text(&self) -> SpiderResult<String> {
        let value = self.evaluate("document.body ? document.body.innerText : ''").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SpiderError::Browser("innerText was not a string".into()))
    }
}

pub type SharedPage = Arc<dyn PageHandle>;

/// The browser session that owns the pages
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self) -> SpiderResult<SharedPage>;

    /// All currently open pages, oldest first
    async fn pages(&self) -> SpiderResult<Vec<SharedPage>>;

    async fn page_count(&self) -> SpiderResult<usize> {
        Ok(self.pages().await?.len())
    }
}

pub type SharedBrowser = Arc<dyn BrowserHandle>;

/// Wait for a page that was not in `known_ids` to appear, polling until
/// `timeout`. Returns the newest unknown page, or None when nothing opened.
pub async fn wait_for_new_page(
    browser: &dyn BrowserHandle,
    known_ids: &[String],
    timeout: Duration,
) -> SpiderResult<Option<SharedPage>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pages = browser.pages().await?;
        if let Some(page) = pages
            .iter()
            .rev()
            .find(|p| !known_ids.contains(&p.id()))
        {
            return Ok(Some(Arc::clone(page)));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
