//! Chromium renderer backend built on chromiumoxide
//!
//! One [`ChromiumEngine`] wraps a launched browser plus the task that drives
//! its DevTools connection. Each capture gets a fresh tab
//! ([`ChromiumContext`]) with its own device metrics and user agent.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{get_chrome_args, ImageFormat, RendererConfig, ViewportSpec, MAX_TIMEOUT_MS};
use crate::error::{CaptureError, NavigationError};
use crate::renderer::{
    CaptureRegion, NavigationResult, RenderContext, RendererEngine, RendererLauncher,
};

/// How long to wait for the buffered main-document response after `goto` returns.
const RESPONSE_GRACE: Duration = Duration::from_millis(500);

pub fn create_browser_config(
    config: &RendererConfig,
    generation: u64,
) -> Result<BrowserConfig, CaptureError> {
    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(MAX_TIMEOUT_MS))
        .args(get_chrome_args(config, generation));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(CaptureError::RendererUnavailable)
}

pub struct ChromiumLauncher {
    config: RendererConfig,
}

impl ChromiumLauncher {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RendererLauncher for ChromiumLauncher {
    async fn launch(&self, generation: u64) -> Result<Arc<dyn RendererEngine>, CaptureError> {
        let browser_config = create_browser_config(&self.config, generation)?;

        let (browser, mut handler) =
            tokio::time::timeout(self.config.launch_timeout, Browser::launch(browser_config))
                .await
                .map_err(|_| {
                    CaptureError::RendererUnavailable(format!(
                        "browser did not start within {:?}",
                        self.config.launch_timeout
                    ))
                })?
                .map_err(|e| CaptureError::RendererUnavailable(e.to_string()))?;

        // The handler is a stream that must be polled for the DevTools
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(generation, "Browser handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        info!(generation, "Browser handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        info!(generation, "Chromium launched");
        Ok(Arc::new(ChromiumEngine {
            browser: RwLock::new(browser),
            handler: handler_task,
            generation,
        }))
    }
}

pub struct ChromiumEngine {
    browser: RwLock<Browser>,
    handler: JoinHandle<Result<(), CdpError>>,
    generation: u64,
}

#[async_trait]
impl RendererEngine for ChromiumEngine {
    async fn open_context(
        &self,
        viewport: &ViewportSpec,
        user_agent: &str,
    ) -> Result<Box<dyn RenderContext>, CaptureError> {
        let page = {
            let browser = self.browser.read().await;
            browser.new_page("about:blank").await.map_err(engine_error)?
        };

        // Wrap first so the tab is released even if setup fails.
        let context = ChromiumContext { page: Some(page) };
        let page = context.page()?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::RendererUnavailable)?;
        page.execute(metrics).await.map_err(engine_error)?;

        if viewport.has_touch {
            let touch = SetTouchEmulationEnabledParams::builder()
                .enabled(true)
                .build()
                .map_err(CaptureError::RendererUnavailable)?;
            page.execute(touch).await.map_err(engine_error)?;
        }

        let agent = SetUserAgentOverrideParams::builder()
            .user_agent(user_agent)
            .build()
            .map_err(CaptureError::RendererUnavailable)?;
        page.execute(agent).await.map_err(engine_error)?;
        page.execute(EnableParams::default())
            .await
            .map_err(engine_error)?;

        debug!(
            generation = self.generation,
            width = viewport.width,
            height = viewport.height,
            mobile = viewport.mobile,
            "Opened render context"
        );
        Ok(Box::new(context))
    }

    async fn is_alive(&self) -> bool {
        if self.handler.is_finished() {
            return false;
        }
        self.browser.read().await.version().await.is_ok()
    }

    async fn shutdown(&self) {
        let mut browser = self.browser.write().await;
        if let Err(e) = browser.close().await {
            debug!(generation = self.generation, "Browser close failed: {}", e);
        }
        self.handler.abort();
    }
}

pub struct ChromiumContext {
    page: Option<Page>,
}

impl ChromiumContext {
    fn page(&self) -> Result<&Page, CaptureError> {
        self.page
            .as_ref()
            .ok_or_else(|| CaptureError::CaptureFailed("render context already closed".into()))
    }
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
    ) -> Result<NavigationResult, CaptureError> {
        let page = self.page()?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(engine_error)?;

        let started = Instant::now();
        match tokio::time::timeout(timeout, page.goto(url.to_string())).await {
            Err(_) => return Err(NavigationError::Timeout(timeout).into()),
            Ok(Err(e)) => return Err(classify_navigation_error(e, timeout).into()),
            Ok(Ok(_)) => {}
        }
        let load_time = started.elapsed();

        // Redirect hops are not reported as responses, so the first
        // document response is the final main-frame response.
        let document = tokio::time::timeout(RESPONSE_GRACE, async {
            while let Some(event) = responses.next().await {
                if event.r#type == ResourceType::Document {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let Some(event) = document else {
            return Err(NavigationError::NetworkFailure("no response received".into()).into());
        };

        let status = u16::try_from(event.response.status).unwrap_or(0);
        let status_text = if event.response.status_text.is_empty() {
            canonical_reason(status).to_string()
        } else {
            event.response.status_text.clone()
        };

        if !(200..300).contains(&status) {
            return Err(NavigationError::NonSuccessStatus {
                status,
                status_text,
            }
            .into());
        }

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| event.response.url.clone());

        Ok(NavigationResult {
            final_url,
            status,
            status_text,
            load_time,
        })
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, CaptureError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(CaptureError::CaptureFailed)?;

        let result = self
            .page()?
            .evaluate_expression(params)
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn capture(
        &self,
        region: CaptureRegion,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CaptureError> {
        let cdp_format = match format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            ImageFormat::Webp => CaptureScreenshotFormat::Webp,
        };

        let mut params = ScreenshotParams::builder()
            .format(cdp_format)
            .full_page(matches!(region, CaptureRegion::FullPage));
        if format.is_lossy() {
            params = params.quality(i64::from(quality));
        }
        if let CaptureRegion::Clip { width, height } = region {
            params = params.clip(Viewport {
                x: 0.0,
                y: 0.0,
                width: f64::from(width),
                height: f64::from(height),
                scale: 1.0,
            });
        }

        self.page()?
            .screenshot(params.build())
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<(), CaptureError> {
        match self.page.take() {
            Some(page) => page
                .close()
                .await
                .map_err(|e| CaptureError::CaptureFailed(format!("failed to close tab: {e}"))),
            None => Ok(()),
        }
    }
}

impl Drop for ChromiumContext {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            // Reached only when the owning pipeline was cancelled before close.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        warn!("Failed to close abandoned tab: {}", e);
                    }
                });
            }
        }
    }
}

fn engine_error(e: CdpError) -> CaptureError {
    CaptureError::RendererUnavailable(e.to_string())
}

fn classify_navigation_error(e: CdpError, timeout: Duration) -> NavigationError {
    let detail = e.to_string();
    if detail.to_ascii_lowercase().contains("timeout") {
        NavigationError::Timeout(timeout)
    } else {
        NavigationError::NetworkFailure(detail)
    }
}

/// Reason phrase for responses that arrive without one (HTTP/2 and later).
fn canonical_reason(status: u16) -> &'static str {
    match status {
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown Status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_reason_fallback() {
        assert_eq!(canonical_reason(404), "Not Found");
        assert_eq!(canonical_reason(599), "Unknown Status");
    }

    // Requires a local Chrome/Chromium installation.
    #[tokio::test]
    #[ignore]
    async fn test_real_browser_captures_page() {
        let launcher = ChromiumLauncher::new(RendererConfig::default());
        let engine = launcher.launch(1).await.expect("launch chromium");
        assert!(engine.is_alive().await);

        let viewport = ViewportSpec::default();
        let mut context = engine
            .open_context(&viewport, crate::config::DEFAULT_USER_AGENT)
            .await
            .unwrap();
        let nav = context
            .navigate("https://example.com", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(nav.status, 200);

        let bytes = context
            .capture(
                CaptureRegion::Clip {
                    width: 800,
                    height: 600,
                },
                ImageFormat::Png,
                90,
            )
            .await
            .unwrap();
        assert!(!bytes.is_empty());
        context.close().await.unwrap();
        engine.shutdown().await;
    }
}
