//! Persistence ports for jobs and usage records, with in-memory adapters.
//!
//! The in-memory adapters back the CLI and the test suite. A deployment that
//! needs durability plugs a database-backed implementation into the same
//! traits.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::job::{CaptureJob, JobId, JobPatch, JobStatus, UsageRecord};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("status conflict: expected {expected}, found {actual}")]
    Conflict {
        expected: JobStatus,
        actual: JobStatus,
    },
}

/// Page request for job listings. Pages are 1-based; a `limit` of zero
/// returns every matching job on a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobQuery {
    pub page: usize,
    pub limit: usize,
    pub status: Option<JobStatus>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 10,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<CaptureJob>,
    pub total_count: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageQuery {
    pub start_date: Option<NaiveDate>,
    /// Inclusive through 23:59:59 of this day.
    pub end_date: Option<NaiveDate>,
}

impl UsageQuery {
    fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let start = self
            .start_date
            .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        let end = self.end_date.and_then(|date| {
            NaiveTime::from_hms_opt(23, 59, 59)
                .map(|time| Utc.from_utc_datetime(&date.and_time(time)))
        });
        (start, end)
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let (start, end) = self.bounds();
        start.map_or(true, |s| timestamp >= s) && end.map_or(true, |e| timestamp <= e)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_count: usize,
    pub counts_by_type: BTreeMap<String, usize>,
    pub records: Vec<UsageRecord>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &CaptureJob) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<CaptureJob>, RepositoryError>;

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<CaptureJob, RepositoryError>;

    /// Apply `patch` only if the stored status equals `expected`, atomically.
    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<CaptureJob, RepositoryError>;

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError>;

    async fn list_by_owner(
        &self,
        owner_id: &str,
        query: &JobQuery,
    ) -> Result<JobPage, RepositoryError>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), RepositoryError>;

    async fn query_by_owner(
        &self,
        owner_id: &str,
        query: &UsageQuery,
    ) -> Result<UsageSummary, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: DashMap<JobId, CaptureJob>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &CaptureJob) -> Result<(), RepositoryError> {
        use dashmap::mapref::entry::Entry;
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(RepositoryError::ConstraintViolation(format!(
                "job {} already exists",
                job.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<CaptureJob>, RepositoryError> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<CaptureJob, RepositoryError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        entry.apply(patch);
        Ok(entry.clone())
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<CaptureJob, RepositoryError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if entry.status != expected {
            return Err(RepositoryError::Conflict {
                expected,
                actual: entry.status,
            });
        }
        if let Some(next) = patch.status {
            if !expected.can_transition_to(next) {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "illegal transition {expected} -> {next}"
                )));
            }
        }
        entry.apply(patch);
        Ok(entry.clone())
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        Ok(self.jobs.remove(&id).is_some())
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        query: &JobQuery,
    ) -> Result<JobPage, RepositoryError> {
        let mut jobs: Vec<CaptureJob> = self
            .jobs
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .filter(|entry| query.status.map_or(true, |status| entry.status == status))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(paginate(jobs, query.page, query.limit))
    }
}

fn paginate(jobs: Vec<CaptureJob>, page: usize, limit: usize) -> JobPage {
    let total_count = jobs.len();
    let current_page = page.max(1);

    if limit == 0 {
        return JobPage {
            jobs,
            total_count,
            current_page: 1,
            total_pages: 1,
            has_next_page: false,
            has_previous_page: false,
        };
    }

    let total_pages = total_count.div_ceil(limit);
    let jobs = jobs
        .into_iter()
        .skip((current_page - 1) * limit)
        .take(limit)
        .collect();

    JobPage {
        jobs,
        total_count,
        current_page,
        total_pages,
        has_next_page: current_page < total_pages,
        has_previous_page: current_page > 1,
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUsageRepository {
    records: RwLock<Vec<UsageRecord>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn append(&self, record: UsageRecord) -> Result<(), RepositoryError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn query_by_owner(
        &self,
        owner_id: &str,
        query: &UsageQuery,
    ) -> Result<UsageSummary, RepositoryError> {
        let records: Vec<UsageRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.owner_id == owner_id && query.contains(record.timestamp))
            .cloned()
            .collect();

        let mut counts_by_type = BTreeMap::new();
        for record in &records {
            *counts_by_type.entry(record.usage_type.clone()).or_insert(0) += 1;
        }

        Ok(UsageSummary {
            total_count: records.len(),
            counts_by_type,
            records,
        })
    }
}
