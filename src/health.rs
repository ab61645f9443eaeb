use crate::{format_duration, CaptureService, RendererStatus, StorageAdapter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub stale_temp_warning: usize,
    pub stale_temp_critical: usize,
    pub failure_rate_warning: f64,
    pub failure_rate_critical: f64,
    /// Captures needed before the failure rate is judged.
    pub min_captures: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_temp_warning: 1,
            stale_temp_critical: 100,
            failure_rate_warning: 0.2,
            failure_rate_critical: 0.5,
            min_captures: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub renderer: HealthLevel,
    pub renderer_status: RendererStatus,
    pub capture_failure_rate: f64,
    pub storage: HealthLevel,
    /// `None` when cloud storage is disabled.
    pub storage_reachable: Option<bool>,
    pub temp_files: HealthLevel,
    pub stale_temp_files: usize,
    pub timestamp: std::time::SystemTime,
}

/// Point-in-time health of the capture service.
///
/// Checking never launches the renderer; a service that has not captured
/// anything yet reports it as not started.
pub struct HealthChecker {
    service: Arc<CaptureService>,
    storage: Option<StorageAdapter>,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(service: Arc<CaptureService>, storage: Option<StorageAdapter>) -> Self {
        Self {
            service,
            storage,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check_system_health(&self) -> HealthStatus {
        let start_time = Instant::now();

        let renderer_status = self.service.renderer().status().await;
        let snapshot = self.service.metrics().snapshot();
        let capture_failure_rate = snapshot.capture_failure_rate();
        let renderer = self.check_renderer_health(
            renderer_status,
            capture_failure_rate,
            snapshot.captures_succeeded + snapshot.captures_failed,
        );

        let storage_reachable = match &self.storage {
            Some(storage) => Some(storage.health_check().await),
            None => None,
        };
        let storage = match storage_reachable {
            Some(false) => {
                warn!("Cloud storage is unreachable; artifacts stay local");
                HealthLevel::Warning
            }
            _ => HealthLevel::Healthy,
        };

        let (temp_files, stale_temp_files) = self.check_temp_health().await;

        let overall = determine_overall_health(&[renderer, storage, temp_files]);
        info!(
            "Health check completed in {}: {:?}",
            format_duration(start_time.elapsed()),
            overall
        );

        HealthStatus {
            overall,
            renderer,
            renderer_status,
            capture_failure_rate,
            storage,
            storage_reachable,
            temp_files,
            stale_temp_files,
            timestamp: std::time::SystemTime::now(),
        }
    }

    fn check_renderer_health(
        &self,
        status: RendererStatus,
        failure_rate: f64,
        captures: u64,
    ) -> HealthLevel {
        let liveness = match status {
            RendererStatus::NotStarted | RendererStatus::Alive { .. } => HealthLevel::Healthy,
            RendererStatus::Disconnected { generation } => {
                warn!(
                    "Renderer generation {} disconnected; next capture relaunches it",
                    generation
                );
                HealthLevel::Warning
            }
        };

        let failures = if captures < self.thresholds.min_captures {
            HealthLevel::Healthy
        } else if failure_rate > self.thresholds.failure_rate_critical {
            error!("Capture failure rate critical: {:.2}%", failure_rate * 100.0);
            HealthLevel::Critical
        } else if failure_rate > self.thresholds.failure_rate_warning {
            warn!("Capture failure rate elevated: {:.2}%", failure_rate * 100.0);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        liveness.max(failures)
    }

    async fn check_temp_health(&self) -> (HealthLevel, usize) {
        match self.service.stale_temp_files().await {
            Ok(count) if count >= self.thresholds.stale_temp_critical => {
                error!("{} stale temp files awaiting cleanup", count);
                (HealthLevel::Critical, count)
            }
            Ok(count) if count >= self.thresholds.stale_temp_warning => {
                warn!("{} stale temp files awaiting cleanup", count);
                (HealthLevel::Warning, count)
            }
            Ok(count) => (HealthLevel::Healthy, count),
            Err(e) => {
                warn!("Failed to scan temp directory: {}", e);
                (HealthLevel::Warning, 0)
            }
        }
    }

    /// Check health on every tick and sweep the temp directory whenever
    /// stale files show up. Runs until the task is dropped.
    pub async fn start_periodic_health_checks(&self, interval_duration: Duration) {
        let mut interval_timer = interval(interval_duration);

        loop {
            interval_timer.tick().await;

            let health_status = self.check_system_health().await;
            match health_status.overall {
                HealthLevel::Healthy => info!("System health: OK"),
                HealthLevel::Warning => warn!(
                    "System health: WARNING - Renderer: {:?}, Storage: {:?}, Temp files: {:?}",
                    health_status.renderer, health_status.storage, health_status.temp_files
                ),
                HealthLevel::Critical => error!(
                    "System health: CRITICAL - Renderer: {:?}, Storage: {:?}, Temp files: {:?}",
                    health_status.renderer, health_status.storage, health_status.temp_files
                ),
            }

            if health_status.stale_temp_files > 0 {
                if let Err(e) = self.service.sweep_temp_dir().await {
                    error!("Temp directory sweep failed: {}", e);
                }
            }
        }
    }
}

pub fn determine_overall_health(healths: &[HealthLevel]) -> HealthLevel {
    healths
        .iter()
        .copied()
        .max()
        .unwrap_or(HealthLevel::Healthy)
}
