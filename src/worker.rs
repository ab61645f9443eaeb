use crate::{CaptureError, CaptureOptions, JobId, JobOrchestrator, ProcessOutcome};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A pending job handed to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub owner_id: String,
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: JobId,
    pub worker_id: usize,
    pub outcome: Result<ProcessOutcome, CaptureError>,
    pub duration: Duration,
}

impl JobReport {
    /// The job reached `completed`.
    pub fn succeeded(&self) -> bool {
        matches!(&self.outcome, Ok(outcome) if outcome.is_completed())
    }
}

#[derive(Clone)]
pub struct JobWorker {
    id: usize,
    orchestrator: Arc<JobOrchestrator>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl JobWorker {
    pub fn new(id: usize, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            id,
            orchestrator,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run_with_shared_receiver(
        &self,
        requests: Arc<Mutex<mpsc::Receiver<JobRequest>>>,
        reports: mpsc::Sender<JobReport>,
    ) {
        debug!("Starting job worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let request = {
                let mut receiver = requests.lock().await;
                receiver.recv().await
            };
            let Some(request) = request else {
                break;
            };

            let report = self.process(request).await;
            if report.succeeded() {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }

            if let Err(e) = reports.send(report).await {
                error!("Worker {} failed to send report: {}", self.id, e);
                break;
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Job worker {} stopped", self.id);
    }

    async fn process(&self, request: JobRequest) -> JobReport {
        let started = Instant::now();
        let outcome = self
            .orchestrator
            .process_job(request.job_id, &request.owner_id)
            .await;

        match &outcome {
            Ok(ProcessOutcome::Completed(_)) => {
                debug!("Worker {} completed job {}", self.id, request.job_id)
            }
            Ok(ProcessOutcome::Failed { message, .. }) => {
                warn!("Worker {} job {} failed: {}", self.id, request.job_id, message)
            }
            Err(e) => error!("Worker {} could not process job {}: {}", self.id, request.job_id, e),
        }

        JobReport {
            job_id: request.job_id,
            worker_id: self.id,
            outcome,
            duration: started.elapsed(),
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running(),
            processed_count: self.processed_count(),
            error_count: self.error_count(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed set of workers draining one job queue.
///
/// At most `concurrency` jobs are processed at a time. Dropping the pool or
/// calling [`WorkerPool::close`] stops intake; queued jobs still finish.
pub struct WorkerPool {
    workers: Vec<JobWorker>,
    handles: Vec<JoinHandle<()>>,
    request_sender: Option<mpsc::Sender<JobRequest>>,
    report_receiver: mpsc::Receiver<JobReport>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, orchestrator: Arc<JobOrchestrator>) -> Self {
        let worker_count = concurrency.max(1);
        let (request_sender, request_receiver) = mpsc::channel(1000);
        let (report_sender, report_receiver) = mpsc::channel(1000);

        let workers: Vec<JobWorker> = (0..worker_count)
            .map(|i| JobWorker::new(i, orchestrator.clone()))
            .collect();

        let shared_receiver = Arc::new(Mutex::new(request_receiver));
        let handles = workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let rx = shared_receiver.clone();
                let tx = report_sender.clone();
                tokio::spawn(async move {
                    worker.run_with_shared_receiver(rx, tx).await;
                })
            })
            .collect();

        info!("Started worker pool with {} workers", worker_count);
        Self {
            workers,
            handles,
            request_sender: Some(request_sender),
            report_receiver,
        }
    }

    pub async fn submit(&self, request: JobRequest) -> Result<(), CaptureError> {
        let sender = self
            .request_sender
            .as_ref()
            .ok_or_else(|| CaptureError::Configuration("worker pool is closed".to_string()))?;
        sender
            .send(request)
            .await
            .map_err(|e| CaptureError::Configuration(format!("worker pool is closed: {e}")))
    }

    pub async fn next_report(&mut self) -> Option<JobReport> {
        self.report_receiver.recv().await
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    /// Reports produced while draining stay readable via `next_report`.
    pub async fn close(&mut self) {
        self.request_sender.take();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(JobWorker::get_stats).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(JobWorker::processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(JobWorker::error_count).sum()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }
}

/// Per-URL result of a batch run.
#[derive(Debug)]
pub struct BatchEntry {
    pub url: String,
    pub job_id: Option<JobId>,
    pub result: Result<ProcessOutcome, CaptureError>,
}

impl BatchEntry {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(outcome) if outcome.is_completed())
    }
}

/// Creates one job per URL and runs them through a [`WorkerPool`].
pub struct BatchProcessor {
    orchestrator: Arc<JobOrchestrator>,
    worker_pool: WorkerPool,
    progress: Option<Arc<ProgressTracker>>,
}

impl BatchProcessor {
    pub fn new(concurrency: usize, orchestrator: Arc<JobOrchestrator>) -> Self {
        let worker_pool = WorkerPool::new(concurrency, orchestrator.clone());
        Self {
            orchestrator,
            worker_pool,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Entries come back in input order. URLs rejected at job creation are
    /// reported without reaching the pool.
    ///
    /// Reports are drained while jobs are still being submitted, so a batch
    /// larger than both channel capacities cannot stall.
    pub async fn process_urls(
        &mut self,
        owner_id: &str,
        urls: Vec<String>,
        options: CaptureOptions,
    ) -> Vec<BatchEntry> {
        info!("Processing batch of {} URLs", urls.len());

        let mut slots: Vec<BatchSlot> = Vec::with_capacity(urls.len());
        let mut queue = VecDeque::new();

        for url in urls {
            match self
                .orchestrator
                .create_job(owner_id, &url, options.clone())
                .await
            {
                Ok(job) => {
                    queue.push_back(JobRequest {
                        job_id: job.id,
                        owner_id: owner_id.to_string(),
                    });
                    slots.push((url, Some(job.id), None));
                }
                Err(e) => {
                    warn!("Skipping {}: {}", url, e);
                    record_progress(&self.progress, false);
                    slots.push((url, None, Some(Err(e))));
                }
            }
        }

        let Some(sender) = self.worker_pool.request_sender.clone() else {
            for slot in slots.iter_mut().filter(|slot| slot.2.is_none()) {
                record_progress(&self.progress, false);
                slot.2 = Some(Err(CaptureError::Configuration(
                    "worker pool is closed".to_string(),
                )));
            }
            return finish_batch(slots);
        };

        let mut outstanding = queue.len();
        while outstanding > 0 {
            tokio::select! {
                permit = sender.reserve(), if !queue.is_empty() => match (permit, queue.pop_front()) {
                    (Ok(permit), Some(request)) => permit.send(request),
                    (Err(e), Some(request)) => {
                        record_progress(&self.progress, false);
                        outstanding -= 1;
                        fill_slot(
                            &mut slots,
                            request.job_id,
                            Err(CaptureError::Configuration(format!("worker pool is closed: {e}"))),
                        );
                    }
                    (_, None) => {}
                },
                report = self.worker_pool.next_report() => {
                    let Some(report) = report else {
                        break;
                    };
                    record_progress(&self.progress, report.succeeded());
                    outstanding -= 1;
                    fill_slot(&mut slots, report.job_id, report.outcome);
                }
            }
        }

        finish_batch(slots)
    }

    pub async fn close(&mut self) {
        self.worker_pool.close().await;
    }

    pub fn get_stats(&self) -> BatchProcessorStats {
        BatchProcessorStats {
            worker_stats: self.worker_pool.get_worker_stats(),
            total_processed: self.worker_pool.total_processed(),
            total_errors: self.worker_pool.total_errors(),
            active_workers: self.worker_pool.active_workers(),
        }
    }
}

type BatchSlot = (String, Option<JobId>, Option<Result<ProcessOutcome, CaptureError>>);

fn record_progress(progress: &Option<Arc<ProgressTracker>>, success: bool) {
    if let Some(progress) = progress {
        progress.record_completion(success);
    }
}

fn fill_slot(slots: &mut [BatchSlot], job_id: JobId, result: Result<ProcessOutcome, CaptureError>) {
    if let Some(slot) = slots.iter_mut().find(|(_, id, _)| *id == Some(job_id)) {
        slot.2 = Some(result);
    }
}

fn finish_batch(slots: Vec<BatchSlot>) -> Vec<BatchEntry> {
    let entries: Vec<BatchEntry> = slots
        .into_iter()
        .map(|(url, job_id, result)| BatchEntry {
            url,
            job_id,
            result: result.unwrap_or_else(|| {
                Err(CaptureError::CaptureFailed(
                    "worker stopped before reporting".to_string(),
                ))
            }),
        })
        .collect();

    info!(
        "Batch finished. Completed: {}, Failed: {}",
        entries.iter().filter(|e| e.succeeded()).count(),
        entries.iter().filter(|e| !e.succeeded()).count()
    );
    entries
}

#[derive(Debug, Clone)]
pub struct BatchProcessorStats {
    pub worker_stats: Vec<WorkerStats>,
    pub total_processed: usize,
    pub total_errors: usize,
    pub active_workers: usize,
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { completed as f64 / secs } else { 0.0 };

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            elapsed,
            rate,
            eta: if completed > 0 && rate > 0.0 {
                let remaining = self.total.saturating_sub(completed);
                Some(Duration::from_secs_f64(remaining as f64 / rate))
            } else {
                None
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    pub rate: f64,
    pub eta: Option<Duration>,
}
