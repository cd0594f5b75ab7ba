//! Job store
//!
//! `JobStore` is the persistence seam for sweep jobs. Creation is atomic on
//! the idempotency key: at most one non-terminal job per key, and the
//! creator receives the job's lease. Only the lease holder may write a job;
//! reaching a terminal state releases both the key and the lease.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{JobStatus, SweepJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a non-terminal job holds the same key.
    /// Returns the stored job and whether it was created now.
    async fn create_or_get(&self, job: SweepJob, holder: &str, lease_ttl: Duration) -> AppResult<(SweepJob, bool)>;

    async fn get(&self, id: &Uuid) -> AppResult<SweepJob>;

    /// Active (non-terminal) job for an idempotency key
    async fn find_by_key(&self, key: &str) -> AppResult<Option<SweepJob>>;

    async fn list_by_status(&self, status: JobStatus) -> AppResult<Vec<SweepJob>>;

    /// Take or renew the lease on a job. `LeaseConflict` when another
    /// holder's lease has not expired.
    async fn acquire_lease(&self, id: &Uuid, holder: &str, ttl: Duration) -> AppResult<()>;

    /// Persist `job`; the caller must hold its lease
    async fn update(&self, job: &SweepJob, holder: &str) -> AppResult<()>;

    async fn request_cancel(&self, id: &Uuid) -> AppResult<()>;

    async fn is_cancel_requested(&self, id: &Uuid) -> bool;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn new(holder: &str, ttl: Duration) -> Self {
        Self {
            holder: holder.to_string(),
            expires_at: Utc::now() + ChronoDuration::milliseconds(ttl.as_millis() as i64),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// In-process store
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, SweepJob>,
    /// idempotency key -> active job
    active_keys: DashMap<String, Uuid>,
    leases: DashMap<Uuid, Lease>,
    cancel_requests: DashSet<Uuid>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Holder of a job's live lease, if any
    pub fn lease_holder(&self, id: &Uuid) -> Option<String> {
        self.leases
            .get(id)
            .filter(|l| l.is_live())
            .map(|l| l.holder.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_or_get(&self, job: SweepJob, holder: &str, lease_ttl: Duration) -> AppResult<(SweepJob, bool)> {
        match self.active_keys.entry(job.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let stored = self
                    .jobs
                    .get(&id)
                    .map(|j| j.clone())
                    .ok_or_else(|| AppError::job_not_found(id))?;
                debug!("🔁 Idempotent enqueue: {} already active as {}", job.idempotency_key, id);
                Ok((stored, false))
            }
            Entry::Vacant(slot) => {
                let id = job.id;
                self.leases.insert(id, Lease::new(holder, lease_ttl));
                self.jobs.insert(id, job.clone());
                slot.insert(id);
                Ok((job, true))
            }
        }
    }

    async fn get(&self, id: &Uuid) -> AppResult<SweepJob> {
        self.jobs
            .get(id)
            .map(|j| j.clone())
            .ok_or_else(|| AppError::job_not_found(id))
    }

    async fn find_by_key(&self, key: &str) -> AppResult<Option<SweepJob>> {
        let id = match self.active_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn list_by_status(&self, status: JobStatus) -> AppResult<Vec<SweepJob>> {
        let mut jobs: Vec<SweepJob> = self
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn acquire_lease(&self, id: &Uuid, holder: &str, ttl: Duration) -> AppResult<()> {
        if !self.jobs.contains_key(id) {
            return Err(AppError::job_not_found(id));
        }
        match self.leases.entry(*id) {
            Entry::Occupied(mut lease) => {
                if lease.get().holder != holder && lease.get().is_live() {
                    return Err(AppError::new(
                        ErrorCode::LeaseConflict,
                        format!("job {} is leased by {}", id, lease.get().holder),
                    ));
                }
                lease.insert(Lease::new(holder, ttl));
            }
            Entry::Vacant(slot) => {
                slot.insert(Lease::new(holder, ttl));
            }
        }
        Ok(())
    }

    async fn update(&self, job: &SweepJob, holder: &str) -> AppResult<()> {
        match self.leases.get(&job.id) {
            Some(lease) if lease.holder == holder => {}
            Some(lease) => {
                return Err(AppError::new(
                    ErrorCode::LeaseConflict,
                    format!("job {} is leased by {}, not {}", job.id, lease.holder, holder),
                ))
            }
            None => {
                return Err(AppError::new(
                    ErrorCode::LeaseConflict,
                    format!("job {} has no lease", job.id),
                ))
            }
        }

        let mut stored = job.clone();
        if stored.is_terminal() {
            stored.archived = true;
            self.active_keys
                .remove_if(&stored.idempotency_key, |_, active| *active == stored.id);
            self.leases.remove(&stored.id);
            self.cancel_requests.remove(&stored.id);
        }
        self.jobs.insert(stored.id, stored);
        Ok(())
    }

    async fn request_cancel(&self, id: &Uuid) -> AppResult<()> {
        let job = self.get(id).await?;
        if !job.is_terminal() {
            self.cancel_requests.insert(*id);
        }
        Ok(())
    }

    async fn is_cancel_requested(&self, id: &Uuid) -> bool {
        self.cancel_requests.contains(id)
    }
}
