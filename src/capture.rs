//! Per-call screenshot generation
//!
//! Every capture launches its own browser, drives one page through
//! configure → navigate → settle → screenshot, and tears both down again on
//! every exit path. The browser is reached through the [`BrowserDriver`]
//! seam so the lifecycle can be exercised without Chrome.

use crate::{format_bytes, format_duration, Config, GenerationError, NetworkIdle, Viewport};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Produces PNG bytes for a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScreenshotGenerator: Send + Sync {
    async fn capture(&self, url: &str) -> Result<Vec<u8>, GenerationError>;
}

/// Starts one isolated browser process per call.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    type Session: BrowserSession;

    async fn launch(&self) -> Result<Self::Session, GenerationError>;
}

#[async_trait]
pub trait BrowserSession: Send {
    type Page: PageSession;

    async fn new_page(&mut self) -> Result<Self::Page, GenerationError>;

    /// Shut the browser process down. Called exactly once, after the page is closed.
    async fn close(&mut self) -> Result<(), GenerationError>;
}

#[async_trait]
pub trait PageSession: Send {
    /// Apply viewport and user agent before any navigation.
    async fn configure(&mut self, settings: &CaptureSettings) -> Result<(), GenerationError>;

    /// Load `url` and wait for network idle. Returns the main document's HTTP
    /// status when the browser reported one.
    async fn navigate(
        &mut self,
        url: &str,
        idle: &NetworkIdle,
    ) -> Result<Option<u16>, GenerationError>;

    /// PNG of the current viewport only.
    async fn screenshot_png(&mut self) -> Result<Vec<u8>, GenerationError>;

    async fn close(&mut self) -> Result<(), GenerationError>;
}

/// The subset of [`Config`] a capture needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub viewport: Viewport,
    pub user_agent: String,
    pub navigation_timeout: Duration,
    pub network_idle: NetworkIdle,
    pub render_settle: Duration,
}

impl From<&Config> for CaptureSettings {
    fn from(config: &Config) -> Self {
        Self {
            viewport: config.viewport.clone(),
            user_agent: config.user_agent.clone(),
            navigation_timeout: config.navigation_timeout,
            network_idle: config.network_idle.clone(),
            render_settle: config.render_settle,
        }
    }
}

/// Status codes a navigation may end with and still be captured.
pub(crate) fn is_loadable(status: u16) -> bool {
    (200..=399).contains(&status)
}

/// Check the bytes really are a decodable PNG and return its dimensions.
fn verify_png(bytes: &[u8]) -> Result<(u32, u32), GenerationError> {
    let reader = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| GenerationError::CaptureFailure(e.to_string()))?;

    if reader.format() != Some(image::ImageFormat::Png) {
        return Err(GenerationError::CaptureFailure(
            "browser returned a non-PNG image".to_string(),
        ));
    }

    reader
        .into_dimensions()
        .map_err(|e| GenerationError::CaptureFailure(e.to_string()))
}

/// [`ScreenshotGenerator`] backed by a real (or fake) browser driver.
pub struct BrowserScreenshotGenerator<D> {
    driver: D,
    settings: CaptureSettings,
}

impl<D: BrowserDriver> BrowserScreenshotGenerator<D> {
    pub fn new(driver: D, settings: CaptureSettings) -> Self {
        Self { driver, settings }
    }

    async fn drive<P: PageSession>(
        &self,
        page: &mut P,
        url: &str,
    ) -> Result<Vec<u8>, GenerationError> {
        page.configure(&self.settings).await?;

        let limit = self.settings.navigation_timeout;
        let status = match timeout(limit, page.navigate(url, &self.settings.network_idle)).await {
            Ok(result) => result?,
            Err(_) => return Err(GenerationError::NavigationTimeout(limit)),
        };

        match status {
            Some(status) if !is_loadable(status) => {
                return Err(GenerationError::PageLoad { status });
            }
            Some(status) => debug!(url, status, "Navigation finished"),
            None => debug!(url, "Navigation finished without a document status"),
        }

        if !self.settings.render_settle.is_zero() {
            sleep(self.settings.render_settle).await;
        }

        let png = page.screenshot_png().await?;
        let (width, height) = verify_png(&png)?;
        debug!(url, width, height, size = %format_bytes(png.len()), "Screenshot captured");

        Ok(png)
    }
}

#[async_trait]
impl<D: BrowserDriver> ScreenshotGenerator for BrowserScreenshotGenerator<D> {
    async fn capture(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        let started = Instant::now();
        let mut browser = self.driver.launch().await?;

        let result = match browser.new_page().await {
            Ok(mut page) => {
                let result = self.drive(&mut page, url).await;
                if let Err(e) = page.close().await {
                    warn!(url, "Failed to close page: {}", e);
                }
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = browser.close().await {
            warn!(url, "Failed to close browser: {}", e);
        }

        match &result {
            Ok(png) => info!(
                url,
                elapsed = %format_duration(started.elapsed()),
                size = %format_bytes(png.len()),
                "Capture complete"
            ),
            Err(e) => warn!(
                url,
                phase = e.phase(),
                elapsed = %format_duration(started.elapsed()),
                "Capture failed: {}",
                e
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(4, 3));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Status(u16),
        Hang,
        NotPng,
        PageOpenFails,
        CloseFails,
    }

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        pages_closed: AtomicUsize,
        browsers_closed: AtomicUsize,
        screenshots: AtomicUsize,
    }

    struct FakeDriver {
        behaviour: Behaviour,
        counters: Arc<Counters>,
    }

    struct FakeBrowser {
        behaviour: Behaviour,
        counters: Arc<Counters>,
    }

    struct FakePage {
        behaviour: Behaviour,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        type Session = FakeBrowser;

        async fn launch(&self) -> Result<FakeBrowser, GenerationError> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            Ok(FakeBrowser {
                behaviour: self.behaviour,
                counters: self.counters.clone(),
            })
        }
    }

    #[async_trait]
    impl BrowserSession for FakeBrowser {
        type Page = FakePage;

        async fn new_page(&mut self) -> Result<FakePage, GenerationError> {
            if let Behaviour::PageOpenFails = self.behaviour {
                return Err(GenerationError::LaunchFailure("no target".to_string()));
            }
            Ok(FakePage {
                behaviour: self.behaviour,
                counters: self.counters.clone(),
            })
        }

        async fn close(&mut self) -> Result<(), GenerationError> {
            self.counters.browsers_closed.fetch_add(1, Ordering::SeqCst);
            if let Behaviour::CloseFails = self.behaviour {
                return Err(GenerationError::PageClosed("already gone".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PageSession for FakePage {
        async fn configure(&mut self, _settings: &CaptureSettings) -> Result<(), GenerationError> {
            Ok(())
        }

        async fn navigate(
            &mut self,
            _url: &str,
            _idle: &NetworkIdle,
        ) -> Result<Option<u16>, GenerationError> {
            match self.behaviour {
                Behaviour::Hang => futures::future::pending().await,
                Behaviour::Status(status) => Ok(Some(status)),
                _ => Ok(Some(200)),
            }
        }

        async fn screenshot_png(&mut self) -> Result<Vec<u8>, GenerationError> {
            self.counters.screenshots.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::NotPng => Ok(b"GIF89a".to_vec()),
                _ => Ok(tiny_png()),
            }
        }

        async fn close(&mut self) -> Result<(), GenerationError> {
            self.counters.pages_closed.fetch_add(1, Ordering::SeqCst);
            if let Behaviour::CloseFails = self.behaviour {
                return Err(GenerationError::PageClosed("already gone".to_string()));
            }
            Ok(())
        }
    }

    fn generator(behaviour: Behaviour) -> (BrowserScreenshotGenerator<FakeDriver>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let settings = CaptureSettings {
            navigation_timeout: Duration::from_millis(50),
            render_settle: Duration::ZERO,
            ..CaptureSettings::from(&Config::default())
        };
        let driver = FakeDriver {
            behaviour,
            counters: counters.clone(),
        };
        (BrowserScreenshotGenerator::new(driver, settings), counters)
    }

    fn assert_cleaned_up(counters: &Counters, pages: usize) {
        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pages_closed.load(Ordering::SeqCst), pages);
        assert_eq!(counters.browsers_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capture_success() {
        let (generator, counters) = generator(Behaviour::Succeed);
        let png = generator.capture("https://example.com").await.unwrap();

        assert_eq!(verify_png(&png).unwrap(), (4, 3));
        assert_cleaned_up(&counters, 1);
    }

    #[tokio::test]
    async fn test_timeout_still_closes_page_and_browser() {
        let (generator, counters) = generator(Behaviour::Hang);
        let err = generator.capture("https://example.com").await.unwrap_err();

        assert_eq!(err, GenerationError::NavigationTimeout(Duration::from_millis(50)));
        assert_eq!(err.phase(), "navigation");
        assert_cleaned_up(&counters, 1);
        assert_eq!(counters.screenshots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_page_load_error() {
        let (generator, counters) = generator(Behaviour::Status(404));
        let err = generator.capture("https://example.com/missing").await.unwrap_err();

        assert_eq!(err, GenerationError::PageLoad { status: 404 });
        assert_eq!(err.status(), Some(404));
        assert_cleaned_up(&counters, 1);
    }

    #[tokio::test]
    async fn test_redirect_status_is_loadable() {
        let (generator, _) = generator(Behaviour::Status(304));
        assert!(generator.capture("https://example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_image_is_capture_failure() {
        let (generator, counters) = generator(Behaviour::NotPng);
        let err = generator.capture("https://example.com").await.unwrap_err();

        assert!(matches!(err, GenerationError::CaptureFailure(_)));
        assert_cleaned_up(&counters, 1);
    }

    #[tokio::test]
    async fn test_browser_closed_when_page_cannot_open() {
        let (generator, counters) = generator(Behaviour::PageOpenFails);
        let err = generator.capture("https://example.com").await.unwrap_err();

        assert_eq!(err.phase(), "launch");
        assert_cleaned_up(&counters, 0);
    }

    #[tokio::test]
    async fn test_close_errors_do_not_mask_result() {
        let (generator, counters) = generator(Behaviour::CloseFails);
        assert!(generator.capture("https://example.com").await.is_ok());
        assert_cleaned_up(&counters, 1);
    }

    #[test]
    fn test_loadable_statuses() {
        assert!(is_loadable(200));
        assert!(is_loadable(301));
        assert!(!is_loadable(404));
        assert!(!is_loadable(500));
        assert!(!is_loadable(101));
    }
}
