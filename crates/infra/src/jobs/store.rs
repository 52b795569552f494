//! Job persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;

use engage_core::TenantId;

use super::types::{DeadLetterEntry, Job, JobId, JobKind, JobStatus};

pub trait JobStore: Send + Sync {
    /// Rejects a job whose `unique_key` is held by an unfinished job of the
    /// same tenant.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Oldest ready job (pending, or failed and due), marked running.
    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError>;

    fn list_by_status(&self, tenant_id: TenantId, status: Option<&str>, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    fn list_by_kind(&self, tenant_id: TenantId, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a fresh attempt count.
    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError>;

    fn delete_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), JobStoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".into())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.read().map_err(|_| poisoned())
    }

    fn jobs_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.write().map_err(|_| poisoned())
    }

    fn dead_letters_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, JobStoreError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }

    fn holder_of_key(jobs: &HashMap<JobId, Job>, tenant_id: TenantId, key: &str) -> Option<JobId> {
        jobs.values()
            .find(|j| j.tenant_id == tenant_id && j.unique_key.as_deref() == Some(key) && !j.status.is_terminal())
            .map(|j| j.id)
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if let Some(key) = job.unique_key.as_deref() {
            if let Some(existing) = Self::holder_of_key(&jobs, job.tenant_id, key) {
                return Err(JobStoreError::AlreadyExists(existing));
            }
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.jobs()?.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.tenant_id == job.tenant_id => {
                *existing = job.clone();
                Ok(())
            }
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. })
                    && j.is_ready_at(now)
                    && tenant_id.is_none_or(|t| j.tenant_id == t)
            })
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut result: Vec<_> = self
            .jobs()?
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.is_none_or(|s| j.status.label() == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn list_by_kind(&self, tenant_id: TenantId, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut result: Vec<_> = self
            .jobs()?
            .values()
            .filter(|j| j.tenant_id == tenant_id && &j.kind == kind)
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        job.status = JobStatus::DeadLettered { error: reason.clone(), attempts: job.attempt };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().filter(|e| e.job.tenant_id == tenant_id).cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        let entry = dls.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if entry.job.tenant_id != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        if let Some(key) = entry.job.unique_key.as_deref() {
            if let Some(existing) = Self::holder_of_key(&jobs, tenant_id, key) {
                return Err(JobStoreError::AlreadyExists(existing));
            }
        }

        let Some(entry) = dls.remove(&job_id) else {
            return Err(JobStoreError::NotFound(job_id));
        };
        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), JobStoreError> {
        let mut dls = self.dead_letters_mut()?;
        match dls.get(&job_id) {
            None => Err(JobStoreError::NotFound(job_id)),
            Some(entry) if entry.job.tenant_id != tenant_id => Err(JobStoreError::TenantIsolation),
            Some(_) => {
                dls.remove(&job_id);
                Ok(())
            }
        }
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();

        for job in self.jobs()?.values().filter(|j| j.tenant_id == tenant_id) {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        stats.dead_lettered += dls.values().filter(|e| e.job.tenant_id == tenant_id).count();

        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, tenant_id: Option<TenantId>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(tenant_id)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn list_by_kind(&self, tenant_id: TenantId, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_kind(tenant_id, kind, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(tenant_id, limit)
    }

    fn retry_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(tenant_id, job_id)
    }

    fn delete_dead_letter(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_dead_letter(tenant_id, job_id)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(tenant: TenantId) -> Job {
        Job::new(tenant, JobKind::GenerateFinancerInvoice, serde_json::json!({}))
    }

    #[test]
    fn claims_oldest_ready_job_once() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let first = store.enqueue(job(tenant)).unwrap();
        store.enqueue(job(tenant)).unwrap();

        let claimed = store.claim_next(Some(tenant)).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        store.claim_next(Some(tenant)).unwrap().unwrap();
        assert!(store.claim_next(Some(tenant)).unwrap().is_none());
    }

    #[test]
    fn unique_key_blocks_only_while_unfinished() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let first = store.enqueue(job(tenant).with_unique_key("fin:2025-03")).unwrap();
        assert_eq!(
            store.enqueue(job(tenant).with_unique_key("fin:2025-03")),
            Err(JobStoreError::AlreadyExists(first))
        );
        // Keys are per tenant.
        assert!(store.enqueue(job(TenantId::new()).with_unique_key("fin:2025-03")).is_ok());

        let mut claimed = store.claim_next(Some(tenant)).unwrap().unwrap();
        claimed.mark_completed(Utc::now());
        store.update(&claimed).unwrap();

        assert!(store.enqueue(job(tenant).with_unique_key("fin:2025-03")).is_ok());
    }

    #[test]
    fn tenants_are_isolated() {
        let store = InMemoryJobStore::new();
        let (t1, t2) = (TenantId::new(), TenantId::new());

        let id = store.enqueue(job(t1)).unwrap();
        assert!(matches!(store.get(t2, id), Err(JobStoreError::TenantIsolation)));
        assert!(store.claim_next(Some(t2)).unwrap().is_none());
    }

    #[test]
    fn dead_letters_can_be_retried() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let id = store.enqueue(job(tenant)).unwrap();

        let claimed = store.claim_next(Some(tenant)).unwrap().unwrap();
        store.dead_letter(claimed, "boom".into()).unwrap();

        assert!(store.get(tenant, id).unwrap().is_none());
        assert_eq!(store.stats(tenant).unwrap().dead_lettered, 1);
        assert_eq!(store.list_dead_letters(tenant, 10).unwrap()[0].reason, "boom");

        let retried = store.retry_dead_letter(tenant, id).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt, 0);
        assert!(store.list_dead_letters(tenant, 10).unwrap().is_empty());
        assert_eq!(store.list_by_status(tenant, Some("pending"), 10).unwrap().len(), 1);
    }
}
