// Rendering engine - rasterizes a report document with a headless browser
//
// The compiler talks to the browser only through `Renderer` and
// `RenderSession`: load a document, wait until its charts are drawn, capture
// element regions as PNG, capture the page as PDF, release.
//
// A session owns a browser process. `render_document` releases it on every
// return path; if the owning task panics or is cancelled instead, dropping
// the chromiumoxide `Browser` kills the child process.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures_util::stream::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Global flag the report page sets once every chart has been drawn
const READY_EXPRESSION: &str = "window.reportReady === true";

/// Interval between readiness probes
const READY_POLL: Duration = Duration::from_millis(100);

/// A4 in inches
const PAGE_WIDTH_IN: f64 = 8.27;
const PAGE_HEIGHT_IN: f64 = 11.69;

/// Errors raised while rendering a report document
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser protocol error: {0}")]
    Protocol(#[from] CdpError),

    #[error("Document not ready: {0}")]
    NotReady(String),

    #[error("Rendering timed out after {0}s")]
    Timeout(u64),

    #[error("No document loaded")]
    NoDocument,

    #[error("Failed to write capture: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens browser sessions
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// One browser session rendering one document
#[async_trait]
pub trait RenderSession: Send {
    /// Loads a local HTML document
    async fn load(&mut self, document: &Path) -> Result<(), RenderError>;

    /// Waits until the document reports ready and every selector resolves
    async fn wait_ready(&mut self, selectors: &[&str]) -> Result<(), RenderError>;

    /// Captures the element matching `selector` as a PNG image
    async fn capture_region(&mut self, selector: &str, output: &Path) -> Result<(), RenderError>;

    /// Prints the whole page to a PDF file
    async fn capture_pdf(&mut self, output: &Path) -> Result<(), RenderError>;

    /// Closes the page and the browser
    async fn release(self: Box<Self>) -> Result<(), RenderError>;
}

/// What to capture from one document
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPlan {
    /// Absolute path of the HTML document
    pub document: PathBuf,

    /// (CSS selector, PNG output path) per captured region
    pub regions: Vec<(&'static str, PathBuf)>,

    /// PDF output path
    pub pdf: PathBuf,
}

/// Runs a full capture in a fresh session bounded by `limit`.
///
/// The session is released whether or not the capture succeeded. A capture
/// error takes precedence over a release error.
pub async fn render_document(
    renderer: &dyn Renderer,
    plan: &RenderPlan,
    limit: Duration,
) -> Result<(), RenderError> {
    let mut session = tokio::time::timeout(limit, renderer.open())
        .await
        .map_err(|_| RenderError::Timeout(limit.as_secs()))??;

    let outcome = tokio::time::timeout(limit, capture(session.as_mut(), plan))
        .await
        .unwrap_or(Err(RenderError::Timeout(limit.as_secs())));

    let released = session.release().await;

    match (outcome, released) {
        (Err(e), Err(release_error)) => {
            warn!("Failed to release browser after error: {}", release_error);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), released) => released,
    }
}

async fn capture(session: &mut dyn RenderSession, plan: &RenderPlan) -> Result<(), RenderError> {
    session.load(&plan.document).await?;

    let selectors: Vec<&str> = plan.regions.iter().map(|(selector, _)| *selector).collect();
    session.wait_ready(&selectors).await?;

    for (selector, output) in &plan.regions {
        session.capture_region(selector, output).await?;
        debug!("Captured {} to {}", selector, output.display());
    }

    session.capture_pdf(&plan.pdf).await?;
    debug!("Printed {}", plan.pdf.display());

    Ok(())
}

/// Headless Chrome/Chromium renderer
pub struct ChromeRenderer {
    /// Browser binary; auto-detected when `None`
    executable: Option<PathBuf>,

    /// Upper bound for the document to report ready
    ready_timeout: Duration,
}

impl ChromeRenderer {
    pub fn new(executable: Option<PathBuf>, ready_timeout: Duration) -> Self {
        ChromeRenderer {
            executable,
            ready_timeout,
        }
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .window_size(1280, 1024);

        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }

        let config = builder.build().map_err(RenderError::Launch)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Launch(e.to_string()))?;

        // The handler drives the CDP connection and must be polled for the
        // whole session
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        debug!("Launched headless browser");

        Ok(Box::new(ChromeSession {
            browser,
            events,
            page: None,
            ready_timeout: self.ready_timeout,
        }))
    }
}

struct ChromeSession {
    browser: Browser,
    events: JoinHandle<()>,
    page: Option<Page>,
    ready_timeout: Duration,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, RenderError> {
        self.page.as_ref().ok_or(RenderError::NoDocument)
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn load(&mut self, document: &Path) -> Result<(), RenderError> {
        let url = format!("file://{}", document.display());
        let page = self.browser.new_page(url.as_str()).await?;
        page.wait_for_navigation().await?;
        self.page = Some(page);
        Ok(())
    }

    async fn wait_ready(&mut self, selectors: &[&str]) -> Result<(), RenderError> {
        let page = self.page()?;
        let deadline = tokio::time::Instant::now() + self.ready_timeout;

        loop {
            let ready = page
                .evaluate(READY_EXPRESSION)
                .await?
                .into_value::<bool>()
                .unwrap_or(false);
            if ready {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RenderError::NotReady(format!(
                    "charts not drawn within {}s",
                    self.ready_timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        for selector in selectors {
            page.find_element(*selector)
                .await
                .map_err(|e| RenderError::NotReady(format!("{}: {}", selector, e)))?;
        }

        Ok(())
    }

    async fn capture_region(&mut self, selector: &str, output: &Path) -> Result<(), RenderError> {
        let element = self.page()?.find_element(selector).await?;
        let image = element.screenshot(CaptureScreenshotFormat::Png).await?;
        tokio::fs::write(output, image).await?;
        Ok(())
    }

    async fn capture_pdf(&mut self, output: &Path) -> Result<(), RenderError> {
        let params = PrintToPdfParams::builder()
            .print_background(true)
            .paper_width(PAGE_WIDTH_IN)
            .paper_height(PAGE_HEIGHT_IN)
            .build();

        let pdf = self.page()?.pdf(params).await?;
        tokio::fs::write(output, pdf).await?;
        Ok(())
    }

    async fn release(mut self: Box<Self>) -> Result<(), RenderError> {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }

        self.browser.close().await?;
        self.browser.wait().await?;

        if let Err(e) = (&mut self.events).await {
            debug!("Browser event loop ended abnormally: {}", e);
        }

        debug!("Closed headless browser");
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.events.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingRenderer, RendererBehavior};
    use std::sync::Arc;

    fn plan(dir: &Path) -> RenderPlan {
        RenderPlan {
            document: dir.join("report.html"),
            regions: vec![
                ("#cpuChart", dir.join("cpu-chart.png")),
                ("#memoryChart", dir.join("memory-chart.png")),
            ],
            pdf: dir.join("full-report.pdf"),
        }
    }

    #[tokio::test]
    async fn test_render_document_captures_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(RecordingRenderer::new(RendererBehavior::Succeed));

        render_document(renderer.as_ref(), &plan(dir.path()), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(dir.path().join("cpu-chart.png").exists());
        assert!(dir.path().join("memory-chart.png").exists());
        assert!(dir.path().join("full-report.pdf").exists());
        assert_eq!(renderer.opened(), 1);
        assert_eq!(renderer.released(), 1);
    }

    #[tokio::test]
    async fn test_session_released_on_capture_failure() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(RecordingRenderer::new(RendererBehavior::FailCapture));

        let result =
            render_document(renderer.as_ref(), &plan(dir.path()), Duration::from_secs(5)).await;

        assert!(matches!(result, Err(RenderError::NotReady(_))));
        assert_eq!(renderer.released(), 1);
        assert!(!dir.path().join("full-report.pdf").exists());
    }

    #[tokio::test]
    async fn test_session_released_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(RecordingRenderer::new(RendererBehavior::Hang));

        let result =
            render_document(renderer.as_ref(), &plan(dir.path()), Duration::from_millis(20)).await;

        assert!(matches!(result, Err(RenderError::Timeout(_))));
        assert_eq!(renderer.released(), 1);
    }
}
