//! In-process renderer fakes and fixtures shared by the unit tests.

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::capture_service::CaptureService;
use crate::config::{Config, ImageFormat, ReadinessConfig, ViewportSpec};
use crate::error::{CaptureError, NavigationError};
use crate::image_transform;
use crate::job::{CaptureJob, JobId, JobPatch, JobStatus};
use crate::metrics::Metrics;
use crate::orchestrator::JobOrchestrator;
use crate::renderer::{
    CaptureRegion, NavigationResult, RenderContext, RendererEngine, RendererLauncher,
};
use crate::repository::{
    InMemoryJobRepository, InMemoryUsageRepository, JobPage, JobQuery, JobRepository,
    RepositoryError,
};
use crate::storage::StorageAdapter;

#[derive(Debug, Clone)]
pub(crate) enum FakeNavigation {
    Succeed,
    /// Never resolves.
    Hang,
    NetworkFailure,
    Status(u16, &'static str),
}

#[derive(Debug, Clone)]
pub(crate) enum FakeEvaluate {
    /// Page reports loaded, no pending images or fonts, DOM already quiet.
    Ready,
    Fail,
    /// Ready page that also reports these framework markers.
    Frameworks(Vec<String>),
    /// Every evaluation hangs.
    Stall,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub launch_delay: Duration,
    /// Latency of every liveness probe.
    pub probe_delay: Duration,
    pub fail_launch: bool,
    pub navigation: FakeNavigation,
    pub nav_delay: Duration,
    pub evaluate: FakeEvaluate,
    pub fail_capture: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            launch_delay: Duration::ZERO,
            probe_delay: Duration::ZERO,
            fail_launch: false,
            navigation: FakeNavigation::Succeed,
            nav_delay: Duration::ZERO,
            evaluate: FakeEvaluate::Ready,
            fail_capture: false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    contexts_opened: AtomicUsize,
    contexts_closed: AtomicUsize,
}

pub(crate) struct FakeLauncher {
    behavior: FakeBehavior,
    counters: Arc<Counters>,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeLauncher {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            counters: Arc::new(Counters::default()),
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.counters.shutdowns.load(Ordering::SeqCst)
    }

    pub fn contexts_opened(&self) -> usize {
        self.counters.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.counters.contexts_closed.load(Ordering::SeqCst)
    }

    /// Simulate the browser process dying under every launched engine.
    pub fn disconnect_all(&self) {
        for engine in self.engines.lock().unwrap().iter() {
            engine.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RendererLauncher for FakeLauncher {
    async fn launch(&self, _generation: u64) -> Result<Arc<dyn RendererEngine>, CaptureError> {
        tokio::time::sleep(self.behavior.launch_delay).await;
        if self.behavior.fail_launch {
            return Err(CaptureError::RendererUnavailable(
                "fake browser failed to start".to_string(),
            ));
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);

        let engine = Arc::new(FakeEngine {
            behavior: self.behavior.clone(),
            counters: self.counters.clone(),
            alive: AtomicBool::new(true),
        });
        self.engines.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

struct FakeEngine {
    behavior: FakeBehavior,
    counters: Arc<Counters>,
    alive: AtomicBool,
}

#[async_trait]
impl RendererEngine for FakeEngine {
    async fn open_context(
        &self,
        viewport: &ViewportSpec,
        _user_agent: &str,
    ) -> Result<Box<dyn RenderContext>, CaptureError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(CaptureError::RendererUnavailable(
                "fake browser disconnected".to_string(),
            ));
        }
        self.counters.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            behavior: self.behavior.clone(),
            viewport: *viewport,
            counters: self.counters.clone(),
            released: AtomicBool::new(false),
        }))
    }

    async fn is_alive(&self) -> bool {
        tokio::time::sleep(self.behavior.probe_delay).await;
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeContext {
    behavior: FakeBehavior,
    viewport: ViewportSpec,
    counters: Arc<Counters>,
    released: AtomicBool,
}

impl FakeContext {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.contexts_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn answer(script: &str, frameworks: &[String]) -> serde_json::Value {
        if script.contains("__NEXT_DATA__") {
            serde_json::json!(frameworks)
        } else if script.contains("MutationObserver") {
            serde_json::json!(true)
        } else if script.contains("document.fonts") || script.contains("document.images") {
            serde_json::json!(0)
        } else if script.contains("readyState") {
            serde_json::json!("complete")
        } else {
            serde_json::Value::Null
        }
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl RenderContext for FakeContext {
    async fn navigate(
        &mut self,
        url: &str,
        _timeout: Duration,
    ) -> Result<NavigationResult, CaptureError> {
        tokio::time::sleep(self.behavior.nav_delay).await;
        match &self.behavior.navigation {
            FakeNavigation::Succeed => Ok(NavigationResult {
                final_url: url.to_string(),
                status: 200,
                status_text: "OK".to_string(),
                load_time: self.behavior.nav_delay,
            }),
            FakeNavigation::Hang => std::future::pending().await,
            FakeNavigation::NetworkFailure => Err(NavigationError::NetworkFailure(
                "net::ERR_NAME_NOT_RESOLVED".to_string(),
            )
            .into()),
            FakeNavigation::Status(status, text) => Err(NavigationError::NonSuccessStatus {
                status: *status,
                status_text: text.to_string(),
            }
            .into()),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, CaptureError> {
        match &self.behavior.evaluate {
            FakeEvaluate::Ready => Ok(Self::answer(script, &[])),
            FakeEvaluate::Frameworks(found) => Ok(Self::answer(script, found)),
            FakeEvaluate::Fail => Err(CaptureError::CaptureFailed(
                "ReferenceError: document is not defined".to_string(),
            )),
            FakeEvaluate::Stall => std::future::pending().await,
        }
    }

    async fn capture(
        &self,
        region: CaptureRegion,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CaptureError> {
        if self.behavior.fail_capture {
            return Err(CaptureError::CaptureFailed("fake capture failed".to_string()));
        }
        let (width, height) = match region {
            CaptureRegion::Clip { width, height } => (width, height),
            CaptureRegion::FullPage => (self.viewport.width, self.viewport.height * 2),
        };
        let scale = self.viewport.device_scale_factor;
        let img = sample_page_image(
            (width as f64 * scale).round() as u32,
            (height as f64 * scale).round() as u32,
        );
        image_transform::encode(&img, format, quality)
    }

    async fn close(self: Box<Self>) -> Result<(), CaptureError> {
        self.release();
        Ok(())
    }
}

/// Page-like test image: light bands with dark glyph runs.
pub(crate) fn sample_page_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let glyph = (x / 3 + y / 5) % 7 == 0 && x % 97 > 20;
        if glyph {
            Rgb([30, 30, 30])
        } else if (y / 24) % 2 == 0 {
            Rgb([250, 250, 250])
        } else {
            Rgb([(x % 256) as u8, (y % 256) as u8, 200])
        }
    }))
}

pub(crate) fn fast_readiness() -> ReadinessConfig {
    ReadinessConfig {
        budget_fraction: 0.5,
        load_ceiling: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        image_ceiling: Duration::from_millis(50),
        font_ceiling: Duration::from_millis(50),
        quiescence_window: Duration::from_millis(10),
        mutation_ceiling: Duration::from_millis(50),
        fallback_wait: Duration::from_millis(50),
    }
}

pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config {
        uploads_dir: root.join("uploads"),
        temp_dir: root.join("temp"),
        readiness: fast_readiness(),
        worker_concurrency: 2,
        ..Default::default()
    };
    config.renderer.probe_timeout = Duration::from_millis(200);
    config
}

/// Job store whose writes into `completed` always fail.
#[derive(Default)]
pub(crate) struct FlakyJobRepository {
    inner: InMemoryJobRepository,
}

impl FlakyJobRepository {
    fn reject(patch: &JobPatch) -> Result<(), RepositoryError> {
        if patch.status == Some(JobStatus::Completed) {
            return Err(RepositoryError::ConnectionFailed(
                "connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for FlakyJobRepository {
    async fn create(&self, job: &CaptureJob) -> Result<(), RepositoryError> {
        self.inner.create(job).await
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<CaptureJob>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<CaptureJob, RepositoryError> {
        Self::reject(&patch)?;
        self.inner.update(id, patch).await
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<CaptureJob, RepositoryError> {
        Self::reject(&patch)?;
        self.inner.transition(id, expected, patch).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        self.inner.delete(id).await
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        query: &JobQuery,
    ) -> Result<JobPage, RepositoryError> {
        self.inner.list_by_owner(owner_id, query).await
    }
}

/// Fully wired pipeline over fakes, rooted in a temp directory.
pub(crate) struct Harness {
    pub dir: TempDir,
    pub launcher: Arc<FakeLauncher>,
    pub service: Arc<CaptureService>,
    pub jobs: Arc<dyn JobRepository>,
    pub usage: Arc<InMemoryUsageRepository>,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl Harness {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self::build(behavior, Arc::new(InMemoryJobRepository::new()), None)
    }

    pub fn with_storage(behavior: FakeBehavior, storage: StorageAdapter) -> Self {
        Self::build(behavior, Arc::new(InMemoryJobRepository::new()), Some(storage))
    }

    pub fn build(
        behavior: FakeBehavior,
        jobs: Arc<dyn JobRepository>,
        storage: Option<StorageAdapter>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::new(behavior));
        let service = Arc::new(
            CaptureService::new(
                test_config(dir.path()),
                launcher.clone(),
                Arc::new(Metrics::new()),
            )
            .unwrap(),
        );
        let usage = Arc::new(InMemoryUsageRepository::new());
        let orchestrator = Arc::new(JobOrchestrator::new(
            service.clone(),
            jobs.clone(),
            usage.clone(),
            storage,
        ));

        Self {
            dir,
            launcher,
            service,
            jobs,
            usage,
            orchestrator,
        }
    }

    pub fn temp_files(&self) -> usize {
        std::fs::read_dir(&self.service.config().temp_dir)
            .unwrap()
            .count()
    }

    pub fn upload_files(&self) -> usize {
        std::fs::read_dir(&self.service.config().uploads_dir)
            .unwrap()
            .count()
    }
}
