use crate::{
    ledger::LedgerError,
    model::{BidId, JobId, JobStatus, LedgerOp, UserId},
    store::StoreError,
};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// User-facing commands, used for authorization and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SubmitBid,
    SelectBid,
    FundEscrow,
    SubmitWork,
    ApproveWork,
    RequestRevision,
    RaiseDispute,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::SubmitBid,
        Action::SelectBid,
        Action::FundEscrow,
        Action::SubmitWork,
        Action::ApproveWork,
        Action::RequestRevision,
        Action::RaiseDispute,
    ];
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::SubmitBid => "submit a bid on",
            Action::SelectBid => "select a bid on",
            Action::FundEscrow => "fund escrow for",
            Action::SubmitWork => "submit work for",
            Action::ApproveWork => "approve work on",
            Action::RequestRevision => "request a revision on",
            Action::RaiseDispute => "raise a dispute on",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Job(JobId),
    Bid(JobId, BidId),
}

impl Display for Missing {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Job(job) => write!(f, "job {}", job),
            Missing::Bid(job, bid) => write!(f, "bid {} on job {}", bid, job),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("{caller} is not allowed to {action} job {job}")]
    Forbidden {
        job: JobId,
        caller: UserId,
        action: Action,
    },
    #[error("cannot {action} job {job} while it is {status}")]
    InvalidState {
        job: JobId,
        action: Action,
        status: JobStatus,
    },
    #[error("freelancer {freelancer} has already bid on job {job}")]
    DuplicateBid { job: JobId, freelancer: UserId },
    #[error("job {0} was modified concurrently, re-read it and retry")]
    Conflict(JobId),
    #[error("a ledger {op} for job {job} is still being confirmed")]
    LedgerPending { job: JobId, op: LedgerOp },
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("ledger outcome for job {job} is unknown: {reason}")]
    LedgerUncertain { job: JobId, reason: String },
    #[error("ledger rejected the transaction: {0}")]
    LedgerRejected(String),
    #[error("integrity fault on job {job}: {reason}")]
    IntegrityFault { job: JobId, reason: String },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("record store failure: {0}")]
    Store(String),
}

impl LifecycleError {
    /// Errors the caller can recover from by re-issuing the command.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Conflict(_) | LifecycleError::LedgerUnavailable(_)
        )
    }

    pub(crate) fn from_store(job: JobId, err: StoreError) -> Self {
        match err {
            StoreError::Conflict { job, .. } => LifecycleError::Conflict(job),
            StoreError::NotFound(job) => LifecycleError::NotFound(Missing::Job(job)),
            StoreError::Duplicate { job, freelancer } => {
                LifecycleError::DuplicateBid { job, freelancer }
            }
            StoreError::Closed { status, .. } => LifecycleError::InvalidState {
                job,
                action: Action::SubmitBid,
                status,
            },
            StoreError::Backend(msg) => LifecycleError::Store(msg),
        }
    }

    pub(crate) fn from_ledger(job: JobId, err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) => LifecycleError::LedgerUnavailable(msg),
            LedgerError::Uncertain { reason, .. } => LifecycleError::LedgerUncertain { job, reason },
            LedgerError::Rejected(msg) => LifecycleError::LedgerRejected(msg),
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
