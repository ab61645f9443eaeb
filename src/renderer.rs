//! Renderer abstraction and lifecycle controller
//!
//! The pipeline talks to the headless browser only through the traits in
//! this module. [`RendererController`] owns the single process-wide engine:
//! it launches lazily, probes liveness before each reuse and relaunches a
//! disconnected engine. Launches are serialized so concurrent first use
//! creates exactly one engine; probing a live engine takes no lock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ImageFormat, ViewportSpec};
use crate::error::CaptureError;
use crate::metrics::Metrics;

/// Region of the page to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRegion {
    /// Top-left `width × height` CSS pixels of the viewport.
    Clip { width: u32, height: u32 },
    FullPage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationResult {
    pub final_url: String,
    pub status: u16,
    pub status_text: String,
    pub load_time: Duration,
}

/// One isolated browser tab.
///
/// Contexts are never reused. Callers must `close` every context they open;
/// implementations also release the tab on drop so a cancelled pipeline
/// cannot leak it.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Load `url` and classify the main-document response. A missing
    /// response counts as a network failure.
    async fn navigate(&mut self, url: &str, timeout: Duration)
        -> Result<NavigationResult, CaptureError>;

    /// Evaluate a script expression, awaiting it if it returns a promise.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, CaptureError>;

    /// Encoded image bytes in `format`. `quality` only applies to lossy formats.
    async fn capture(
        &self,
        region: CaptureRegion,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CaptureError>;

    async fn close(self: Box<Self>) -> Result<(), CaptureError>;
}

#[async_trait]
pub trait RendererEngine: Send + Sync {
    async fn open_context(
        &self,
        viewport: &ViewportSpec,
        user_agent: &str,
    ) -> Result<Box<dyn RenderContext>, CaptureError>;

    /// Cheap liveness probe. Must not launch anything.
    async fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

#[async_trait]
pub trait RendererLauncher: Send + Sync {
    async fn launch(&self, generation: u64) -> Result<Arc<dyn RendererEngine>, CaptureError>;
}

/// Shared reference to a live engine.
#[derive(Clone)]
pub struct RendererHandle {
    engine: Arc<dyn RendererEngine>,
    generation: u64,
}

impl RendererHandle {
    /// Increments on every launch; lets callers tell a relaunched engine apart.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn open_context(
        &self,
        viewport: &ViewportSpec,
        user_agent: &str,
    ) -> Result<Box<dyn RenderContext>, CaptureError> {
        self.engine.open_context(viewport, user_agent).await
    }
}

impl std::fmt::Debug for RendererHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererHandle")
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererStatus {
    NotStarted,
    Alive { generation: u64 },
    Disconnected { generation: u64 },
}

pub struct RendererController {
    launcher: Arc<dyn RendererLauncher>,
    current: RwLock<Option<RendererHandle>>,
    /// Held only while launching or disposing.
    launch_gate: Mutex<()>,
    generation: AtomicU64,
    probe_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl RendererController {
    pub fn new(
        launcher: Arc<dyn RendererLauncher>,
        probe_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            launcher,
            current: RwLock::new(None),
            launch_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            probe_timeout,
            metrics,
        }
    }

    /// Return a live handle, launching or relaunching the engine if needed.
    ///
    /// Liveness probes run without any lock held, so concurrent pipelines
    /// probe in parallel. Only launches are serialized.
    pub async fn acquire(&self) -> Result<RendererHandle, CaptureError> {
        let current = self.current.read().await.clone();
        match current {
            Some(handle) if self.probe(&handle).await => Ok(handle),
            Some(handle) => {
                warn!(
                    generation = handle.generation,
                    "Renderer disconnected, relaunching"
                );
                self.relaunch(Some(handle.generation)).await
            }
            None => self.relaunch(None).await,
        }
    }

    /// Replace the engine the caller saw as `stale` (`None` when there was
    /// none). A caller that lost the race gets the winner's engine.
    async fn relaunch(&self, stale: Option<u64>) -> Result<RendererHandle, CaptureError> {
        let _gate = self.launch_gate.lock().await;

        let current = self.current.read().await.clone();
        if let Some(handle) = current {
            if Some(handle.generation) != stale {
                debug!(generation = handle.generation, "Renderer already replaced");
                return Ok(handle);
            }
        }

        let replaced = self.current.write().await.take();
        if let Some(replaced) = replaced {
            replaced.engine.shutdown().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Launching renderer");
        let engine = self.launcher.launch(generation).await?;
        self.metrics.record_renderer_launch();

        let handle = RendererHandle { engine, generation };
        *self.current.write().await = Some(handle.clone());
        Ok(handle)
    }

    /// Report renderer state without launching anything. Does not wait for
    /// an in-flight launch.
    pub async fn status(&self) -> RendererStatus {
        let handle = self.current.read().await.clone();
        match handle {
            None => RendererStatus::NotStarted,
            Some(handle) if self.probe(&handle).await => RendererStatus::Alive {
                generation: handle.generation,
            },
            Some(handle) => RendererStatus::Disconnected {
                generation: handle.generation,
            },
        }
    }

    /// Close the shared engine. The next `acquire` launches a new one.
    pub async fn dispose(&self) {
        let _gate = self.launch_gate.lock().await;
        let handle = self.current.write().await.take();
        if let Some(handle) = handle {
            info!(generation = handle.generation, "Disposing renderer");
            handle.engine.shutdown().await;
        }
    }

    async fn probe(&self, handle: &RendererHandle) -> bool {
        match tokio::time::timeout(self.probe_timeout, handle.engine.is_alive()).await {
            Ok(alive) => alive,
            Err(_) => {
                debug!(generation = handle.generation, "Renderer liveness probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeLauncher};

    fn controller(launcher: Arc<FakeLauncher>) -> RendererController {
        RendererController::new(launcher, Duration::from_millis(200), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_lazy_launch_and_reuse() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::default()));
        let controller = controller(launcher.clone());

        assert_eq!(controller.status().await, RendererStatus::NotStarted);
        assert_eq!(launcher.launch_count(), 0);

        let first = controller.acquire().await.unwrap();
        let second = controller.acquire().await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(
            controller.status().await,
            RendererStatus::Alive { generation: 1 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_first_use_launches_once() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior {
            launch_delay: Duration::from_millis(50),
            ..Default::default()
        }));
        let controller = Arc::new(controller(launcher.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.acquire().await.map(|h| h.generation()) })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_liveness_probes_run_concurrently() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior {
            probe_delay: Duration::from_millis(150),
            ..Default::default()
        }));
        let controller = RendererController::new(
            launcher.clone(),
            Duration::from_secs(1),
            Arc::new(Metrics::new()),
        );
        controller.acquire().await.unwrap();

        let started = std::time::Instant::now();
        let (first, second) = tokio::join!(controller.acquire(), controller.acquire());
        assert_eq!(first.unwrap().generation(), 1);
        assert_eq!(second.unwrap().generation(), 1);
        assert!(
            started.elapsed() < Duration::from_millis(280),
            "probes were serialized: {:?}",
            started.elapsed()
        );
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_status_does_not_wait_for_launch() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior {
            launch_delay: Duration::from_millis(500),
            ..Default::default()
        }));
        let controller = Arc::new(controller(launcher.clone()));

        let launching = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await.map(|h| h.generation()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), controller.status())
            .await
            .expect("status blocked behind the launch");
        assert_eq!(status, RendererStatus::NotStarted);

        assert_eq!(launching.await.unwrap().unwrap(), 1);
        assert_eq!(
            controller.status().await,
            RendererStatus::Alive { generation: 1 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_relaunch_after_disconnect_launches_once() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior {
            launch_delay: Duration::from_millis(30),
            ..Default::default()
        }));
        let controller = Arc::new(controller(launcher.clone()));
        controller.acquire().await.unwrap();
        launcher.disconnect_all();

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.acquire().await.map(|h| h.generation()) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 2);
        }
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_engine_is_replaced() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::default()));
        let controller = controller(launcher.clone());

        let first = controller.acquire().await.unwrap();
        launcher.disconnect_all();
        assert_eq!(
            controller.status().await,
            RendererStatus::Disconnected { generation: 1 }
        );

        let second = controller.acquire().await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_slot_empty() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior {
            fail_launch: true,
            ..Default::default()
        }));
        let controller = controller(launcher.clone());

        assert!(matches!(
            controller.acquire().await,
            Err(CaptureError::RendererUnavailable(_))
        ));
        assert_eq!(controller.status().await, RendererStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_dispose_closes_engine() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::default()));
        let controller = controller(launcher.clone());

        controller.acquire().await.unwrap();
        controller.dispose().await;
        assert_eq!(launcher.shutdown_count(), 1);
        assert_eq!(controller.status().await, RendererStatus::NotStarted);

        controller.dispose().await;
        assert_eq!(launcher.shutdown_count(), 1);
    }
}
