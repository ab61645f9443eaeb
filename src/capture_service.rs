//! Capture pipeline for a single URL
//!
//! `CaptureService` drives one capture from a validated URL to a finished
//! file in the uploads directory: acquire the shared renderer, open a fresh
//! context, navigate and wait for readiness under the job timeout, capture,
//! then transform. The render context is closed and the raw temp file
//! removed on every exit path.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::ChromiumLauncher;
use crate::config::{CaptureOptions, Config, ImageFormat, ViewportSpec};
use crate::error::{CaptureError, NavigationError};
use crate::image_transform::{self, TransformOutput};
use crate::job::ArtifactDescriptor;
use crate::metrics::Metrics;
use crate::readiness;
use crate::renderer::{CaptureRegion, RenderContext, RendererController, RendererLauncher};
use crate::url_validator::UrlValidator;
use crate::utils::{artifact_file_name, local_artifact_url, TEMP_FILE_PREFIX};

/// A finished capture on local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub original_byte_size: u64,
    pub optimized: bool,
}

impl LocalArtifact {
    pub fn into_descriptor(self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            local_url: Some(local_artifact_url(&self.file_name)),
            local_path: Some(self.path),
            remote_url: None,
            remote_key: None,
            file_name: self.file_name,
            format: self.format,
            width: self.width,
            height: self.height,
            byte_size: self.byte_size,
            original_byte_size: self.original_byte_size,
            optimized: self.optimized,
            stored_remotely: false,
        }
    }
}

/// Keeps the active-capture gauge honest when a capture is cancelled.
struct ActiveCapture<'a>(&'a Metrics);

impl<'a> ActiveCapture<'a> {
    fn start(metrics: &'a Metrics) -> Self {
        metrics.capture_started();
        Self(metrics)
    }
}

impl Drop for ActiveCapture<'_> {
    fn drop(&mut self) {
        self.0.capture_finished();
    }
}

/// URL-to-image capture service
///
/// # Examples
///
/// ```rust,no_run
/// use page_capture::{CaptureOptions, CaptureService, Config, Metrics};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = CaptureService::with_chromium(Config::default(), Arc::new(Metrics::new()))?;
///     let artifact = service
///         .capture_url("https://example.com", CaptureOptions::default())
///         .await?;
///     println!("Captured {}x{} into {}", artifact.width, artifact.height, artifact.path.display());
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct CaptureService {
    config: Config,
    renderer: Arc<RendererController>,
    validator: UrlValidator,
    metrics: Arc<Metrics>,
}

impl CaptureService {
    pub fn new(
        config: Config,
        launcher: Arc<dyn RendererLauncher>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, CaptureError> {
        std::fs::create_dir_all(&config.uploads_dir)?;
        std::fs::create_dir_all(&config.temp_dir)?;

        let renderer = Arc::new(RendererController::new(
            launcher,
            config.renderer.probe_timeout,
            metrics.clone(),
        ));
        let validator = UrlValidator::new(config.blacklisted_domains.iter().cloned());

        Ok(Self {
            config,
            renderer,
            validator,
            metrics,
        })
    }

    pub fn with_chromium(config: Config, metrics: Arc<Metrics>) -> Result<Self, CaptureError> {
        let launcher = Arc::new(ChromiumLauncher::new(config.renderer.clone()));
        Self::new(config, launcher, metrics)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn validator(&self) -> &UrlValidator {
        &self.validator
    }

    pub fn renderer(&self) -> &Arc<RendererController> {
        &self.renderer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Validate `raw_url` and `options`, then capture. Nothing is allocated
    /// for a rejected URL.
    pub async fn capture_url(
        &self,
        raw_url: &str,
        options: CaptureOptions,
    ) -> Result<LocalArtifact, CaptureError> {
        let url = self.validator.validate(raw_url)?;
        let options = options.validated()?;
        self.capture(&url, &options).await
    }

    /// Capture an already validated URL with validated options.
    pub async fn capture(
        &self,
        url: &Url,
        options: &CaptureOptions,
    ) -> Result<LocalArtifact, CaptureError> {
        let started = Instant::now();
        let _active = ActiveCapture::start(&self.metrics);

        let result = self.run_capture(url, options).await;
        self.metrics.record_capture(started.elapsed(), result.is_ok());

        match &result {
            Ok(artifact) => info!(
                url = %url,
                file = %artifact.file_name,
                bytes = artifact.byte_size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Capture finished"
            ),
            Err(e) => warn!(url = %url, "Capture failed: {}", e),
        }
        result
    }

    async fn run_capture(
        &self,
        url: &Url,
        options: &CaptureOptions,
    ) -> Result<LocalArtifact, CaptureError> {
        let handle = self.renderer.acquire().await?;
        let viewport = options.viewport();
        let mut context = handle
            .open_context(&viewport, &self.config.renderer.user_agent)
            .await?;

        let rendered = self
            .render(context.as_mut(), url, options, &viewport)
            .await;

        if let Err(e) = context.close().await {
            warn!(url = %url, "Failed to close render context: {}", e);
        }

        let raw = rendered?;
        self.finish(raw, options).await
    }

    async fn render(
        &self,
        context: &mut dyn RenderContext,
        url: &Url,
        options: &CaptureOptions,
        viewport: &ViewportSpec,
    ) -> Result<Vec<u8>, CaptureError> {
        let timeout = options.timeout();
        let started = Instant::now();
        let readiness_config = &self.config.readiness;

        let loaded = tokio::time::timeout(timeout, async {
            let navigation = context.navigate(url.as_str(), timeout).await?;
            let budget = timeout
                .mul_f64(readiness_config.budget_fraction)
                .min(timeout.saturating_sub(started.elapsed()));
            let report = readiness::wait_until_ready(&*context, readiness_config, budget).await;
            Ok::<_, CaptureError>((navigation, report))
        })
        .await;

        let (navigation, report) = match loaded {
            Ok(result) => result?,
            Err(_) => return Err(NavigationError::Timeout(timeout).into()),
        };
        if report.fell_back {
            self.metrics.record_readiness_fallback();
        }
        debug!(
            final_url = %navigation.final_url,
            status = navigation.status,
            load_ms = navigation.load_time.as_millis() as u64,
            readiness_ms = report.elapsed.as_millis() as u64,
            "Page ready for capture"
        );

        let region = if options.full_page {
            CaptureRegion::FullPage
        } else {
            CaptureRegion::Clip {
                width: viewport.width,
                height: viewport.height,
            }
        };
        context
            .capture(region, options.format, options.quality)
            .await
    }

    async fn finish(
        &self,
        raw: Vec<u8>,
        options: &CaptureOptions,
    ) -> Result<LocalArtifact, CaptureError> {
        let format = options.format;
        let quality = options.quality;
        let optimize = options.optimize;
        let original_byte_size = raw.len() as u64;

        let file_name = artifact_file_name(format, Utc::now());
        let path = self.config.uploads_dir.join(&file_name);
        let temp_dir = self.config.temp_dir.clone();

        // A cancelled caller drops the staged file along with the task output.
        let (staged, output) = tokio::task::spawn_blocking(move || {
            stage_artifact(&raw, &temp_dir, format, quality, optimize)
        })
        .await??;
        publish(staged, &path)?;

        Ok(LocalArtifact {
            path,
            file_name,
            format,
            width: output.width,
            height: output.height,
            byte_size: output.byte_size,
            original_byte_size,
            optimized: optimize,
        })
    }

    /// Delete `temp_*` files older than `temp_max_age`.
    pub async fn sweep_temp_dir(&self) -> Result<usize, CaptureError> {
        let removed = self.scan_temp_dir(true).await?;
        if removed > 0 {
            info!(removed, "Removed stale temp files");
        }
        Ok(removed)
    }

    /// Number of `temp_*` files older than `temp_max_age`.
    pub async fn stale_temp_files(&self) -> Result<usize, CaptureError> {
        self.scan_temp_dir(false).await
    }

    async fn scan_temp_dir(&self, remove: bool) -> Result<usize, CaptureError> {
        let max_age = self.config.temp_max_age;
        let mut matched = 0;
        let mut entries = tokio::fs::read_dir(&self.config.temp_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry
                .file_name()
                .to_string_lossy()
                .starts_with(TEMP_FILE_PREFIX)
            {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if !metadata.is_file() || age <= max_age {
                continue;
            }

            if !remove {
                matched += 1;
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => matched += 1,
                Err(e) => warn!(path = %entry.path().display(), "Failed to remove temp file: {}", e),
            }
        }

        Ok(matched)
    }

    /// Close the shared renderer.
    pub async fn shutdown(&self) {
        self.renderer.dispose().await;
    }
}

/// Produce the finished image as a temp file in `temp_dir`. The raw capture
/// is written alongside it and removed before this returns.
fn stage_artifact(
    raw: &[u8],
    temp_dir: &Path,
    format: ImageFormat,
    quality: u8,
    optimize: bool,
) -> Result<(NamedTempFile, TransformOutput), CaptureError> {
    let mut raw_file = temp_file(temp_dir, format)?;
    raw_file.write_all(raw)?;
    raw_file.flush()?;

    if !optimize {
        let output = image_transform::inspect(raw_file.path())?;
        return Ok((raw_file, output));
    }

    let staged = temp_file(temp_dir, format)?;
    let output = image_transform::optimize(raw_file.path(), staged.path(), format, quality)?;
    Ok((staged, output))
}

fn temp_file(temp_dir: &Path, format: ImageFormat) -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .suffix(&format!(".{}", format.extension()))
        .tempfile_in(temp_dir)
}

/// Move a staged artifact to `target`.
fn publish(staged: NamedTempFile, target: &Path) -> Result<(), CaptureError> {
    if let Err(e) = staged.persist(target) {
        // Rename fails across filesystems; copy instead.
        if let Err(copy_error) = std::fs::copy(e.file.path(), target) {
            let _ = std::fs::remove_file(target);
            return Err(copy_error.into());
        }
    }
    Ok(())
}
