//! Chromium driver over chromiumoxide.
//!
//! One launched browser with a single page per driver instance. CDP
//! commands back the interaction primitives; JavaScript evaluation backs
//! the storage and text probes.

use super::{BrowserDriver, Cookie, DriverFactory, LaunchOptions, NavigationResponse};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{SetCookieParams, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Launches Chromium browsers configured for a presented identity.
pub struct ChromiumFactory;

#[async_trait]
impl DriverFactory for ChromiumFactory {
    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserDriver>> {
        Ok(Box::new(ChromiumDriver::launch(opts).await?))
    }
}

/// A live Chromium browser with one active page.
pub struct ChromiumDriver {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    viewport: StdMutex<(u32, u32)>,
}

impl ChromiumDriver {
    /// Launch a browser presenting the identity in `opts`.
    pub async fn launch(opts: LaunchOptions) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .window_size(opts.viewport.0, opts.viewport.1)
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!(
                "--lang={}",
                opts.accept_language
                    .split(',')
                    .next()
                    .unwrap_or("en-US")
            ));
        if !opts.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|e| anyhow!(e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launching chromium")?;

        // Drive the CDP event stream; the loop ends when the browser
        // connection drops, which doubles as the liveness signal.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("opening initial page")?;

        page.set_user_agent(opts.user_agent.as_str())
            .await
            .context("setting user agent")?;

        let driver = Self {
            browser: Mutex::new(browser),
            page,
            handler: handler_task,
            viewport: StdMutex::new(opts.viewport),
        };
        driver
            .set_viewport(opts.viewport.0, opts.viewport.1)
            .await?;

        if let Some(script) = &opts.on_load_script {
            driver.inject_on_load(script).await?;
        }

        debug!("chromium launched with viewport {:?}", opts.viewport);
        Ok(driver)
    }

    async fn dispatch_mouse(&self, params: DispatchMouseEventParams) -> Result<()> {
        self.page
            .execute(params)
            .await
            .context("dispatching mouse event")?;
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<NavigationResponse> {
        let started = Instant::now();
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url))
            .await
            .map_err(|_| anyhow!("navigation timed out after {timeout_ms}ms"))?
            .with_context(|| format!("navigating to {url}"))?;

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        let title = self.page.get_title().await.ok().flatten();

        // Best-effort main-document status via the Navigation Timing API.
        let status = self
            .page
            .evaluate(
                "window.performance.getEntriesByType('navigation')[0]?.responseStatus ?? null",
            )
            .await
            .ok()
            .and_then(|r| r.value().cloned())
            .and_then(|v| v.as_u64())
            .map(|s| s as u16)
            .filter(|s| *s != 0);

        Ok(NavigationResponse {
            url: url.to_string(),
            final_url,
            status,
            title,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn execute_js(&self, js: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(js).await.context("evaluating script")?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn visible_text_len(&self) -> Result<usize> {
        let value = self
            .execute_js("document.body ? document.body.innerText.length : 0")
            .await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.dispatch_mouse(params).await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("finding {selector}"))?
            .click()
            .await
            .with_context(|| format!("clicking {selector}"))?;
        Ok(())
    }

    async fn focus(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("finding {selector}"))?
            .focus()
            .await
            .with_context(|| format!("focusing {selector}"))?;
        Ok(())
    }

    async fn type_char(&self, c: char) -> Result<()> {
        let params = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text(c.to_string())
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .execute(params)
            .await
            .context("dispatching key event")?;
        Ok(())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.execute_js(&format!(
            "window.scrollBy({{left: {dx}, top: {dy}, behavior: 'smooth'}})"
        ))
        .await?;
        Ok(())
    }

    async fn hover(&self, selector: &str) -> Result<()> {
        let (x, y) = self.element_center(selector).await?;
        self.move_mouse(x, y).await
    }

    async fn element_center(&self, selector: &str) -> Result<(f64, f64)> {
        let point = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("finding {selector}"))?
            .clickable_point()
            .await
            .with_context(|| format!("locating {selector}"))?;
        Ok((point.x, point.y))
    }

    async fn viewport(&self) -> Result<(u32, u32)> {
        Ok(*self.viewport.lock().unwrap())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .execute(params)
            .await
            .context("overriding viewport")?;
        *self.viewport.lock().unwrap() = (width, height);
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.page
            .set_user_agent(user_agent)
            .await
            .context("setting user agent")?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .context("reading cookies")?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: if c.expires >= 0.0 { Some(c.expires) } else { None },
                http_only: c.http_only,
                secure: c.secure,
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()> {
        for c in cookies {
            let mut builder = SetCookieParams::builder()
                .name(c.name)
                .value(c.value)
                .domain(c.domain)
                .path(c.path)
                .http_only(c.http_only)
                .secure(c.secure);
            if let Some(expires) = c.expires {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }
            let params = match builder.build() {
                Ok(params) => params,
                Err(e) => {
                    warn!("skipping malformed cookie: {e}");
                    continue;
                }
            };
            self.page
                .execute(params)
                .await
                .context("installing cookie")?;
        }
        Ok(())
    }

    async fn local_storage(&self) -> Result<HashMap<String, String>> {
        let value = self
            .execute_js(
                "JSON.stringify(Object.fromEntries(Object.entries(localStorage)))",
            )
            .await?;
        let raw = value.as_str().unwrap_or("{}");
        Ok(serde_json::from_str(raw).unwrap_or_default())
    }

    async fn set_local_storage(&self, entries: HashMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let data = serde_json::to_string(&entries).context("serializing storage")?;
        self.execute_js(&format!(
            "(() => {{ const data = {data}; for (const [k, v] of Object.entries(data)) localStorage.setItem(k, v); }})()"
        ))
        .await?;
        Ok(())
    }

    async fn inject_on_load(&self, script: &str) -> Result<()> {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(script)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .execute(params)
            .await
            .context("installing on-load script")?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!("browser close failed: {e}");
        }
        if let Err(e) = browser.wait().await {
            warn!("browser wait failed: {e}");
        }
        self.handler.abort();
        Ok(())
    }
}
