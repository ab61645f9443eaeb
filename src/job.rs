//! Capture job model
//!
//! A job moves `pending → processing → completed | failed` and never back.
//! `result` is present exactly when the job completed and `error_message`
//! exactly when it failed; [`CaptureJob::apply`] keeps both in step with the
//! status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::{CaptureOptions, ImageFormat};

pub const USAGE_URL_CAPTURE: &str = "url_capture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Where a finished capture lives and what it looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub local_path: Option<PathBuf>,
    pub local_url: Option<String>,
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub file_name: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub original_byte_size: u64,
    pub optimized: bool,
    pub stored_remotely: bool,
}

impl ArtifactDescriptor {
    /// URL a client should fetch: the remote copy when uploaded, otherwise
    /// the local `/uploads` route.
    pub fn location(&self) -> Option<&str> {
        self.remote_url.as_deref().or(self.local_url.as_deref())
    }

    /// Record a successful upload. The local file is gone at this point.
    pub fn mark_stored_remotely(&mut self, url: String, key: String) {
        self.remote_url = Some(url);
        self.remote_key = Some(key);
        self.stored_remotely = true;
        self.local_path = None;
        self.local_url = None;
    }

    pub fn dimensions(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureJob {
    pub id: JobId,
    pub owner_id: String,
    pub source_url: String,
    pub status: JobStatus,
    pub options: CaptureOptions,
    pub result: Option<ArtifactDescriptor>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CaptureJob {
    pub fn new(owner_id: impl Into<String>, source_url: impl Into<String>, options: CaptureOptions) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id: owner_id.into(),
            source_url: source_url.into(),
            status: JobStatus::Pending,
            options,
            result: None,
            error_message: None,
            created_at: now,
            processing_started_at: None,
            processing_completed_at: None,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
            match status {
                JobStatus::Completed => self.error_message = None,
                JobStatus::Failed => self.result = None,
                _ => {}
            }
        }
        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(message) = patch.error_message {
            self.error_message = Some(message);
        }
        if let Some(started) = patch.processing_started_at {
            self.processing_started_at = Some(started);
        }
        if let Some(completed) = patch.processing_completed_at {
            self.processing_completed_at = Some(completed);
        }
        self.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
    }

    /// Status, result and error message agree with each other.
    pub fn is_consistent(&self) -> bool {
        let result_ok = self.result.is_some() == (self.status == JobStatus::Completed);
        let error_ok = self.error_message.is_some() == (self.status == JobStatus::Failed);
        let started_ok = self.status == JobStatus::Pending || self.processing_started_at.is_some();
        let completed_ok = self.status.is_terminal() == self.processing_completed_at.is_some();
        result_ok && error_ok && started_ok && completed_ok
    }
}

/// Partial update applied to a stored job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub result: Option<ArtifactDescriptor>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn processing(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            processing_started_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    pub fn completed(artifact: ArtifactDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result: Some(artifact),
            processing_completed_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(message.into()),
            processing_completed_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }
}

/// Append-only usage entry, aggregated by type and date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub job_id: Option<JobId>,
    #[serde(rename = "type")]
    pub usage_type: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl UsageRecord {
    pub fn new(owner_id: impl Into<String>, job_id: Option<JobId>, usage_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            job_id,
            usage_type: usage_type.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one `process_job` call that reached a terminal state.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed(ArtifactDescriptor),
    Failed {
        message: String,
        error: crate::error::CaptureError,
    },
}

impl ProcessOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed(_))
    }

    pub fn artifact(&self) -> Option<&ArtifactDescriptor> {
        match self {
            ProcessOutcome::Completed(artifact) => Some(artifact),
            ProcessOutcome::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_artifact() -> ArtifactDescriptor {
    ArtifactDescriptor {
        local_path: Some(PathBuf::from("uploads/screenshot_1_abc.png")),
        local_url: Some("/uploads/screenshot_1_abc.png".to_string()),
        remote_url: None,
        remote_key: None,
        file_name: "screenshot_1_abc.png".to_string(),
        format: ImageFormat::Png,
        width: 1200,
        height: 800,
        byte_size: 1024,
        original_byte_size: 2048,
        optimized: true,
        stored_remotely: false,
    }
}
