//! chromiumoxide-backed browser implementation
//!
//! Launches Chrome/Chromium over CDP, drives the connection from a spawned
//! handler task, and adapts `Page` to the [`PageHandle`] contract. Known
//! benign CDP deserialization noise is filtered out of the handler loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use log::{error, info, trace};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::BrowserConfig;
use crate::error::{SpiderError, SpiderResult};

use super::{BrowserHandle, PageHandle, SharedPage};

/// Launch a browser session per the configuration
pub async fn launch_browser(config: &BrowserConfig) -> Result<(CdpBrowser, JoinHandle<()>)> {
    let user_data_dir =
        std::env::temp_dir().join(format!("somspider_chrome_{}", std::process::id()));
    std::fs::create_dir_all(&user_data_dir).context("Failed to create user data directory")?;

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(config.viewport_width, config.viewport_height)
        .user_data_dir(user_data_dir);

    if config.headless {
        builder = builder.headless_mode(HeadlessMode::default());
    } else {
        builder = builder.with_head();
    }

    builder = builder
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--ignore-certificate-errors")
        .arg("--disable-popup-blocking")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    let browser_config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")?;

    let handler_task = tokio::task::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let message = e.to_string();
                // Chrome emits CDP events chromiumoxide cannot deserialize;
                // those are not connection failures.
                let benign = message
                    .contains("data did not match any variant of untagged enum Message")
                    || message.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP error: {message}");
                } else {
                    error!("browser handler error: {message}");
                }
            }
        }
        info!("browser handler task completed");
    });

    Ok((CdpBrowser::new(browser), handler_task))
}

/// [`BrowserHandle`] over a chromiumoxide browser
pub struct CdpBrowser {
    browser: Arc<Browser>,
}

impl CdpBrowser {
    #[must_use]
    pub fn new(browser: Browser) -> Self {
        Self {
            browser: Arc::new(browser),
        }
    }
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_page(&self) -> SpiderResult<SharedPage> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| SpiderError::Browser(format!("new_page: {e}")))?;
        Ok(Arc::new(CdpPage { page }))
    }

    async fn pages(&self) -> SpiderResult<Vec<SharedPage>> {
        let pages = self
            .browser
            .pages()
            .await
            .map_err(|e| SpiderError::Browser(format!("pages: {e}")))?;
        Ok(pages
            .into_iter()
            .map(|page| Arc::new(CdpPage { page }) as SharedPage)
            .collect())
    }
}

/// [`PageHandle`] over a chromiumoxide page
pub struct CdpPage {
    page: Page,
}

#[async_trait]
impl PageHandle for CdpPage {
    fn id(&self) -> String {
        format!("{:?}", self.page.target_id())
    }

    async fn goto(&self, url: &str, timeout: Duration) -> SpiderResult<()> {
        let navigation = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| SpiderError::Browser(format!("goto {url}: {e}")))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| SpiderError::Browser(format!("wait_for_navigation: {e}")))?;
            Ok(())
        };
        match tokio::time::timeout(timeout, navigation).await {
            Ok(result) => result,
            Err(_) => Err(SpiderError::timeout("Page navigation", timeout.as_secs())),
        }
    }

    async fn current_url(&self) -> SpiderResult<String> {
        self.page
            .url()
            .await
            .map_err(|e| SpiderError::Browser(format!("url: {e}")))?
            .ok_or_else(|| SpiderError::Browser("page has no URL".into()))
    }

    async fn evaluate(&self, js: &str) -> SpiderResult<Value> {
        let result = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| SpiderError::Browser(format!("evaluate: {e}")))?;
        // Scripts returning undefined have no value; that is a null result,
        // not a failure.
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn screenshot(&self) -> SpiderResult<Vec<u8>> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            ..Default::default()
        };
        self.page
            .screenshot(params)
            .await
            .map_err(|e| SpiderError::Browser(format!("screenshot: {e}")))
    }

    async fn go_back(&self, timeout: Duration) -> SpiderResult<()> {
        self.evaluate("history.back()").await?;
        let settle = timeout.min(Duration::from_secs(10));
        tokio::time::sleep(settle.min(Duration::from_millis(1500))).await;
        Ok(())
    }

    async fn close(&self) -> SpiderResult<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| SpiderError::Browser(format!("close: {e}")))
    }

    async fn is_closed(&self) -> bool {
        // A closed target rejects trivial evaluation
        self.page.evaluate("1").await.is_err()
    }
}
