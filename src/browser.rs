//! Chromium implementation of the browser seam
//!
//! One `ChromiumSession` owns one Chrome process, its CDP handler task and a
//! throwaway profile directory. Navigation is driven over raw CDP so the main
//! document status, the network error text and the in-flight request count are
//! all observable.

use crate::capture::{is_loadable, BrowserDriver, BrowserSession, CaptureSettings, PageSession};
use crate::{create_browser_config, Config, GenerationError, NetworkIdle};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, LoaderId, RequestId, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLoadEventFired, NavigateParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fragments of CDP errors raised when the tab or browser went away mid-call.
const CLOSED_TARGET_MARKERS: &[&str] = &[
    "Target closed",
    "No target with given id",
    "Session with given id not found",
    "channel closed",
    "receiver is gone",
];

fn is_closed_target(err: &CdpError) -> bool {
    let message = err.to_string();
    CLOSED_TARGET_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

fn closed_or(err: CdpError, otherwise: fn(String) -> GenerationError) -> GenerationError {
    if is_closed_target(&err) {
        GenerationError::PageClosed(err.to_string())
    } else {
        otherwise(err.to_string())
    }
}

/// Launches a fresh headless Chrome for every capture.
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    config: Config,
}

impl ChromiumDriver {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn profile_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "screenshot-cache-{}-{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<ChromiumSession, GenerationError> {
        let profile_dir = Self::profile_dir();
        tokio::fs::create_dir_all(&profile_dir).await?;

        let browser_config = match create_browser_config(&self.config, &profile_dir) {
            Ok(config) => config,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(GenerationError::LaunchFailure(e));
            }
        };

        let (browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(GenerationError::LaunchFailure(e.to_string()));
            }
        };

        // The handler stream must be polled for any CDP command to complete.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        debug!(profile = %profile_dir.display(), "Browser launched");

        Ok(ChromiumSession {
            browser,
            handler,
            profile_dir,
            closed: false,
        })
    }
}

async fn remove_profile(profile_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(profile_dir).await {
        warn!(profile = %profile_dir.display(), "Failed to remove browser profile: {}", e);
    }
}

/// Synchronous profile removal for `Drop`. Inside a runtime the work goes to the
/// blocking pool and the handle is returned; otherwise it runs inline.
fn discard_profile(profile_dir: PathBuf) -> Option<JoinHandle<std::io::Result<()>>> {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Some(runtime.spawn_blocking(move || std::fs::remove_dir_all(profile_dir))),
        Err(_) => {
            let _ = std::fs::remove_dir_all(profile_dir);
            None
        }
    }
}

pub struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    closed: bool,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    type Page = ChromiumPage;

    async fn new_page(&mut self) -> Result<ChromiumPage, GenerationError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| closed_or(e, GenerationError::LaunchFailure))?;

        Ok(ChromiumPage { page: Some(page) })
    }

    async fn close(&mut self) -> Result<(), GenerationError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match self.browser.close().await {
            Ok(_) => {
                if let Err(e) = self.browser.wait().await {
                    warn!("Failed to reap browser process: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                if let Some(Err(kill_err)) = self.browser.kill().await {
                    warn!("Failed to kill browser process: {}", kill_err);
                }
                Err(GenerationError::LaunchFailure(format!(
                    "browser did not close cleanly: {e}"
                )))
            }
        };

        self.handler.abort();
        remove_profile(&self.profile_dir).await;
        result
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler.abort();
        if !self.closed {
            // Browser's own Drop kills the child; only the profile is left to us.
            discard_profile(std::mem::take(&mut self.profile_dir));
        }
    }
}

pub struct ChromiumPage {
    page: Option<Page>,
}

impl ChromiumPage {
    fn page(&self) -> Result<&Page, GenerationError> {
        self.page
            .as_ref()
            .ok_or_else(|| GenerationError::PageClosed("page already closed".to_string()))
    }

    /// Subscribe before navigating so no request of the new document is missed.
    async fn page_events(&self) -> Result<BoxStream<'static, PageEvent>, GenerationError> {
        let page = self.page()?;
        let subscribe = |e: CdpError| closed_or(e, GenerationError::NavigationFailed);

        page.execute(network::EnableParams::default())
            .await
            .map_err(subscribe)?;

        let sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(subscribe)?
            .map(|e| PageEvent::RequestSent(e.request_id.clone()));
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(subscribe)?
            .map(|e| PageEvent::RequestDone(e.request_id.clone()));
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(subscribe)?
            .map(|e| PageEvent::RequestDone(e.request_id.clone()));
        let responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(subscribe)?
            .map(|e| PageEvent::Response {
                loader_id: e.loader_id.clone(),
                is_document: e.r#type == ResourceType::Document,
                status: e.response.status,
            });
        let loaded = page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(subscribe)?
            .map(|_| PageEvent::Loaded);

        Ok(stream::select_all(vec![
            sent.boxed(),
            finished.boxed(),
            failed.boxed(),
            responses.boxed(),
            loaded.boxed(),
        ])
        .boxed())
    }
}

enum PageEvent {
    RequestSent(RequestId),
    RequestDone(RequestId),
    Response {
        loader_id: LoaderId,
        is_document: bool,
        status: i64,
    },
    Loaded,
}

/// In-flight requests and the main document's status for one navigation.
struct NetworkTracker {
    loader_id: Option<LoaderId>,
    inflight: HashSet<RequestId>,
    document_status: Option<u16>,
    loaded: bool,
}

impl NetworkTracker {
    fn new(loader_id: Option<LoaderId>) -> Self {
        Self {
            loader_id,
            inflight: HashSet::new(),
            document_status: None,
            loaded: false,
        }
    }

    fn observe(&mut self, event: PageEvent) {
        match event {
            PageEvent::RequestSent(id) => {
                self.inflight.insert(id);
            }
            PageEvent::RequestDone(id) => {
                self.inflight.remove(&id);
            }
            PageEvent::Response {
                loader_id,
                is_document,
                status,
            } => {
                if is_document && self.loader_id.as_ref() == Some(&loader_id) {
                    self.document_status = u16::try_from(status).ok();
                }
            }
            PageEvent::Loaded => self.loaded = true,
        }
    }

    /// Apply every event already buffered on the stream without waiting for more.
    fn drain_ready<S>(&mut self, events: &mut S)
    where
        S: Stream<Item = PageEvent> + Unpin,
    {
        while let Some(Some(event)) = events.next().now_or_never() {
            self.observe(event);
        }
    }

    /// Classify a navigation Chrome reported as failed.
    fn navigation_error(&self, error_text: &str) -> GenerationError {
        match self.document_status {
            Some(status) if !is_loadable(status) => GenerationError::PageLoad { status },
            _ => GenerationError::NavigationFailed(error_text.to_string()),
        }
    }

    async fn wait_for_load<S>(&mut self, events: &mut S) -> Result<(), GenerationError>
    where
        S: Stream<Item = PageEvent> + Unpin,
    {
        while !self.loaded {
            let event = events.next().await.ok_or_else(page_gone)?;
            self.observe(event);
        }
        Ok(())
    }

    /// Idle once no more than `max_inflight` requests stayed open for the whole window.
    async fn wait_for_idle<S>(
        &mut self,
        events: &mut S,
        idle: &NetworkIdle,
    ) -> Result<(), GenerationError>
    where
        S: Stream<Item = PageEvent> + Unpin,
    {
        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.inflight.len() > idle.max_inflight {
                quiet_since = None;
                let event = events.next().await.ok_or_else(page_gone)?;
                self.observe(event);
                continue;
            }

            let deadline = *quiet_since.get_or_insert_with(Instant::now) + idle.quiet_window;
            match timeout_at(deadline, events.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(event)) => self.observe(event),
                Ok(None) => return Err(page_gone()),
            }
        }
    }
}

fn page_gone() -> GenerationError {
    GenerationError::PageClosed("page closed during navigation".to_string())
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn configure(&mut self, settings: &CaptureSettings) -> Result<(), GenerationError> {
        let page = self.page()?;
        let viewport = &settings.viewport;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(GenerationError::LaunchFailure)?;

        page.execute(metrics)
            .await
            .map_err(|e| closed_or(e, GenerationError::LaunchFailure))?;
        page.execute(SetUserAgentOverrideParams::new(settings.user_agent.clone()))
            .await
            .map_err(|e| closed_or(e, GenerationError::LaunchFailure))?;

        Ok(())
    }

    async fn navigate(
        &mut self,
        url: &str,
        idle: &NetworkIdle,
    ) -> Result<Option<u16>, GenerationError> {
        let mut events = self.page_events().await?;
        let page = self.page()?;

        let navigation = page
            .execute(NavigateParams::new(url))
            .await
            .map_err(|e| closed_or(e, GenerationError::NavigationFailed))?;

        let mut tracker = NetworkTracker::new(navigation.result.loader_id.clone());

        if let Some(error_text) = &navigation.result.error_text {
            // Chrome fails empty-bodied 4xx/5xx documents here, after their response arrived.
            tracker.drain_ready(&mut events);
            return Err(tracker.navigation_error(error_text));
        }

        tracker.wait_for_load(&mut events).await?;
        debug!(url, inflight = tracker.inflight.len(), "Load event fired");

        tracker.wait_for_idle(&mut events, idle).await?;

        info!(url, status = ?tracker.document_status, "Page settled");
        Ok(tracker.document_status)
    }

    async fn screenshot_png(&mut self) -> Result<Vec<u8>, GenerationError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();

        self.page()?
            .screenshot(params)
            .await
            .map_err(|e| closed_or(e, GenerationError::CaptureFailure))
    }

    async fn close(&mut self) -> Result<(), GenerationError> {
        match self.page.take() {
            Some(page) => page
                .close()
                .await
                .map_err(|e| closed_or(e, GenerationError::CaptureFailure)),
            None => Ok(()),
        }
    }
}
