//! Job lifecycle
//!
//! `JobOrchestrator` owns the `pending → processing → completed | failed`
//! state machine on top of the capture pipeline. Entry into processing is a
//! compare-and-set on the stored status, so a job is processed at most once
//! even when several callers race for it.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::capture_service::CaptureService;
use crate::config::CaptureOptions;
use crate::error::{CaptureError, ErrorSeverity};
use crate::job::{
    ArtifactDescriptor, CaptureJob, JobId, JobPatch, JobStatus, ProcessOutcome, UsageRecord,
    USAGE_URL_CAPTURE,
};
use crate::repository::{
    JobPage, JobQuery, JobRepository, RepositoryError, UsageQuery, UsageRepository, UsageSummary,
};
use crate::storage::{generate_thumbnail_key, StorageAdapter};

/// Stored on jobs whose processing was interrupted.
pub const CANCELLED_MESSAGE: &str = "Capture cancelled";

pub struct JobOrchestrator {
    service: Arc<CaptureService>,
    jobs: Arc<dyn JobRepository>,
    usage: Arc<dyn UsageRepository>,
    storage: Option<StorageAdapter>,
}

impl JobOrchestrator {
    pub fn new(
        service: Arc<CaptureService>,
        jobs: Arc<dyn JobRepository>,
        usage: Arc<dyn UsageRepository>,
        storage: Option<StorageAdapter>,
    ) -> Self {
        Self {
            service,
            jobs,
            usage,
            storage,
        }
    }

    pub fn service(&self) -> &Arc<CaptureService> {
        &self.service
    }

    /// Validate and store a new pending job. Unsafe URLs and invalid options
    /// are rejected before anything is written.
    pub async fn create_job(
        &self,
        owner_id: &str,
        raw_url: &str,
        options: CaptureOptions,
    ) -> Result<CaptureJob, CaptureError> {
        let url = self.service.validator().validate(raw_url)?;
        let options = options.validated()?;

        let job = CaptureJob::new(owner_id, url.as_str(), options);
        self.jobs.create(&job).await?;
        info!(job_id = %job.id, owner_id, url = %job.source_url, "Capture job created");
        Ok(job)
    }

    /// Run a pending job to a terminal state.
    ///
    /// Returns `Ok` for both terminal outcomes. `Err` means the job was not
    /// processed at all (missing, foreign, not pending), or that the
    /// terminal state could not be written, in which case the artifact is
    /// carried in [`CaptureError::StateWrite`].
    pub async fn process_job(
        &self,
        job_id: JobId,
        owner_id: &str,
    ) -> Result<ProcessOutcome, CaptureError> {
        let job = self.owned_job(job_id, owner_id).await?;
        if job.status != JobStatus::Pending {
            return Err(CaptureError::JobNotPending(job.status));
        }

        let job = match self
            .jobs
            .transition(job_id, JobStatus::Pending, JobPatch::processing(Utc::now()))
            .await
        {
            Ok(job) => job,
            Err(RepositoryError::Conflict { actual, .. }) => {
                debug!(job_id = %job_id, actual = %actual, "Lost the race to process job");
                return Err(CaptureError::JobNotPending(actual));
            }
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %job_id, url = %job.source_url, "Processing capture job");
        let in_flight = InFlightJob::new(self.jobs.clone(), job_id);

        let captured = match self.service.validator().validate(&job.source_url) {
            Ok(url) => self.service.capture(&url, &job.options).await,
            Err(e) => Err(e.into()),
        };

        let outcome = match captured {
            Ok(local) => {
                let mut artifact = local.into_descriptor();
                self.store_remotely(&job, &mut artifact).await;
                self.complete(&job, artifact).await
            }
            Err(e) => self.fail(&job, e).await,
        };
        in_flight.disarm();
        outcome
    }

    async fn store_remotely(&self, job: &CaptureJob, artifact: &mut ArtifactDescriptor) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(local_path) = artifact.local_path.clone() else {
            return;
        };

        let now = Utc::now();
        let key = generate_thumbnail_key(&job.owner_id, artifact.format, now);
        let metadata = upload_metadata(job, artifact, now);

        let outcome = storage
            .upload_and_relocate(&local_path, &key, metadata, None)
            .await;
        match (outcome.success, outcome.url) {
            (true, Some(url)) => {
                info!(job_id = %job.id, key = %outcome.key, "Artifact stored remotely");
                artifact.mark_stored_remotely(url, outcome.key);
            }
            _ => {
                self.service.metrics().record_upload_failure();
                warn!(
                    job_id = %job.id,
                    "Cloud upload failed, serving local artifact: {}",
                    outcome.error.unwrap_or_default()
                );
            }
        }
    }

    async fn complete(
        &self,
        job: &CaptureJob,
        artifact: ArtifactDescriptor,
    ) -> Result<ProcessOutcome, CaptureError> {
        let now = Utc::now();
        let written = self
            .jobs
            .transition(
                job.id,
                JobStatus::Processing,
                JobPatch::completed(artifact.clone(), now),
            )
            .await;

        if let Err(source) = written {
            error!(job_id = %job.id, "Failed to record completed job: {}", source);
            let fallback = CaptureError::Persistence(source.clone()).user_message();
            if let Err(e) = self
                .jobs
                .transition(job.id, JobStatus::Processing, JobPatch::failed(fallback, now))
                .await
            {
                error!(job_id = %job.id, "Failed to record job failure: {}", e);
            }
            self.service.metrics().record_job(false);
            return Err(CaptureError::StateWrite {
                artifact: Box::new(artifact),
                source,
            });
        }

        let record = UsageRecord::new(job.owner_id.clone(), Some(job.id), USAGE_URL_CAPTURE)
            .with_metadata("url", job.source_url.clone())
            .with_metadata("format", artifact.format.as_str())
            .with_metadata("dimensions", artifact.dimensions())
            .with_metadata("storedRemotely", artifact.stored_remotely.to_string());
        if let Err(e) = self.usage.append(record).await {
            warn!(job_id = %job.id, "Failed to record usage: {}", e);
        }

        self.service.metrics().record_job(true);
        info!(
            job_id = %job.id,
            location = artifact.location().unwrap_or_default(),
            "Capture job completed"
        );
        Ok(ProcessOutcome::Completed(artifact))
    }

    async fn fail(
        &self,
        job: &CaptureJob,
        error: CaptureError,
    ) -> Result<ProcessOutcome, CaptureError> {
        let message = error.user_message();
        match error.severity() {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(job_id = %job.id, "Capture job failed: {}", error)
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(job_id = %job.id, "Capture job failed: {}", error)
            }
        }

        self.jobs
            .transition(
                job.id,
                JobStatus::Processing,
                JobPatch::failed(message.clone(), Utc::now()),
            )
            .await?;
        self.service.metrics().record_job(false);

        Ok(ProcessOutcome::Failed { message, error })
    }

    /// One-off capture with no job record and no cloud upload.
    pub async fn capture_direct(
        &self,
        raw_url: &str,
        options: CaptureOptions,
    ) -> Result<ArtifactDescriptor, CaptureError> {
        let artifact = self.service.capture_url(raw_url, options).await?;
        Ok(artifact.into_descriptor())
    }

    pub async fn get_job(&self, job_id: JobId, owner_id: &str) -> Result<CaptureJob, CaptureError> {
        self.owned_job(job_id, owner_id).await
    }

    pub async fn list_jobs(
        &self,
        owner_id: &str,
        query: &JobQuery,
    ) -> Result<JobPage, CaptureError> {
        Ok(self.jobs.list_by_owner(owner_id, query).await?)
    }

    /// Remove a job that is not being processed. The local artifact file is
    /// deleted best-effort; remote objects are left in place.
    pub async fn delete_job(&self, job_id: JobId, owner_id: &str) -> Result<(), CaptureError> {
        let job = self.owned_job(job_id, owner_id).await?;
        if job.status == JobStatus::Processing {
            return Err(CaptureError::JobNotPending(job.status));
        }

        if !self.jobs.delete(job_id).await? {
            return Err(CaptureError::JobNotFound(job_id.to_string()));
        }

        if let Some(path) = job.result.as_ref().and_then(|r| r.local_path.as_ref()) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(job_id = %job_id, path = %path.display(), "Local artifact not removed: {}", e);
            }
        }
        info!(job_id = %job_id, owner_id, "Capture job deleted");
        Ok(())
    }

    pub async fn usage_analytics(
        &self,
        owner_id: &str,
        query: &UsageQuery,
    ) -> Result<UsageSummary, CaptureError> {
        Ok(self.usage.query_by_owner(owner_id, query).await?)
    }

    async fn owned_job(&self, job_id: JobId, owner_id: &str) -> Result<CaptureJob, CaptureError> {
        let job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;
        if job.owner_id != owner_id {
            return Err(CaptureError::AccessDenied(job_id.to_string()));
        }
        Ok(job)
    }
}

/// Fails a job whose `process_job` future was dropped while processing.
struct InFlightJob {
    jobs: Arc<dyn JobRepository>,
    job_id: JobId,
    armed: bool,
}

impl InFlightJob {
    fn new(jobs: Arc<dyn JobRepository>, job_id: JobId) -> Self {
        Self {
            jobs,
            job_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightJob {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let job_id = self.job_id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(job_id = %job_id, "Capture job cancelled with no runtime to record it");
            return;
        };
        warn!(job_id = %job_id, "Capture job cancelled while processing");

        let jobs = self.jobs.clone();
        runtime.spawn(async move {
            let patch = JobPatch::failed(CANCELLED_MESSAGE, Utc::now());
            if let Err(e) = jobs.transition(job_id, JobStatus::Processing, patch).await {
                warn!(job_id = %job_id, "Failed to record cancelled job: {}", e);
            }
        });
    }
}

fn upload_metadata(
    job: &CaptureJob,
    artifact: &ArtifactDescriptor,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ownerId".to_string(), job.owner_id.clone()),
        ("jobId".to_string(), job.id.to_string()),
        ("originalUrl".to_string(), job.source_url.clone()),
        ("captureDate".to_string(), now.to_rfc3339()),
        ("dimensions".to_string(), artifact.dimensions()),
        ("format".to_string(), artifact.format.as_str().to_string()),
    ])
}
