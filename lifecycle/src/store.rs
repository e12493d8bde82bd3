use crate::model::{Bid, BidId, Job, JobFilter, JobId, JobStatus, NewBid, NewJob, UserId};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, future::Future};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {job} is no longer at version {expected}")]
    Conflict { job: JobId, expected: u64 },
    #[error("freelancer {freelancer} already has a bid on job {job}")]
    Duplicate { job: JobId, freelancer: UserId },
    #[error("job {job} is {status} and no longer accepts bids")]
    Closed { job: JobId, status: JobStatus },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("{0}")]
    Backend(String),
}

/// Versioned repository of jobs and their bids.
///
/// Every committed mutation increments `Job::version`. Writers never lock a
/// row: `compare_and_set` only succeeds when the stored version still matches
/// the version the caller read.
pub trait RecordStore: Send + Sync {
    fn insert(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, StoreError>> + Send;

    fn get(&self, id: JobId) -> impl Future<Output = Result<Job, StoreError>> + Send;

    /// Persist `job` if the stored version is still `expected_version`.
    /// Bids are owned by `append_bid` and are not rewritten here.
    fn compare_and_set(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> impl Future<Output = Result<Job, StoreError>> + Send;

    /// Append a bid to an OPEN job. Fails with `Duplicate` if the freelancer
    /// already bid and with `Closed` if the job left OPEN.
    fn append_bid(
        &self,
        id: JobId,
        freelancer: UserId,
        bid: NewBid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, StoreError>> + Send;

    /// Jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;
}

#[derive(Default)]
struct Arena {
    // Job ids are dense and start at 1, so `jobs[id - 1]` is the job.
    jobs: Vec<Job>,
    bids_by_freelancer: HashMap<(JobId, UserId), BidId>,
    next_bid: u64,
}

impl Arena {
    fn slot(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        id.0.checked_sub(1)
            .and_then(|ix| self.jobs.get_mut(ix as usize))
            .ok_or(StoreError::NotFound(id))
    }
}

/// In-process `RecordStore`: an arena of jobs indexed by id.
#[derive(Default)]
pub struct MemoryStore {
    arena: Mutex<Arena>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    async fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut arena = self.arena.lock().await;
        let id = JobId(arena.jobs.len() as u64 + 1);
        let job = Job {
            id,
            client_id: new.client_id,
            title: new.title,
            description: new.description,
            budget: new.budget,
            deadline: new.deadline,
            category: new.category,
            skills: new.skills,
            status: JobStatus::Open,
            bids: Vec::new(),
            selected_bid_id: None,
            escrow_funded: false,
            escrow_tx_ref: None,
            completion_tx_ref: None,
            work_submission: None,
            revision_note: None,
            dispute_reason: None,
            pending_ledger_op: None,
            integrity_fault: None,
            created_at: now,
            version: 1,
        };
        arena.jobs.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let mut arena = self.arena.lock().await;
        arena.slot(id).cloned()
    }

    async fn compare_and_set(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Job, StoreError> {
        let mut arena = self.arena.lock().await;
        let stored = arena.slot(id)?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                job: id,
                expected: expected_version,
            });
        }
        let bids = std::mem::take(&mut stored.bids);
        *stored = Job {
            id,
            bids,
            version: expected_version + 1,
            ..job
        };
        Ok(stored.clone())
    }

    async fn append_bid(
        &self,
        id: JobId,
        freelancer: UserId,
        bid: NewBid,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut arena = self.arena.lock().await;
        let status = arena.slot(id)?.status;
        if status != JobStatus::Open {
            return Err(StoreError::Closed { job: id, status });
        }
        let key = (id, freelancer.clone());
        if arena.bids_by_freelancer.contains_key(&key) {
            return Err(StoreError::Duplicate {
                job: id,
                freelancer,
            });
        }
        arena.next_bid += 1;
        let bid_id = BidId(arena.next_bid);
        arena.bids_by_freelancer.insert(key, bid_id);
        let job = arena.slot(id)?;
        job.bids.push(Bid {
            id: bid_id,
            job_id: id,
            freelancer_id: freelancer,
            payout_address: bid.payout_address,
            amount: bid.amount,
            delivery_days: bid.delivery_days,
            proposal: bid.proposal,
            created_at: now,
        });
        job.version += 1;
        Ok(job.clone())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let arena = self.arena.lock().await;
        Ok(arena
            .jobs
            .iter()
            .rev()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }
}
