//! Transition table of the job lifecycle.
//!
//! Everything here is pure: functions take the current `Job` and return the
//! next one without touching the store or the ledger. The coordinator and the
//! reconciler commit the results with a version-guarded write.

use crate::{
    error::{Action, LifecycleError, Missing, Result},
    model::{
        BidId, Job, JobStatus, LedgerIntent, LedgerOp, TxRef, UserId, WorkSubmission,
    },
};
use chrono::{DateTime, Utc};

fn statuses_for(action: Action) -> &'static [JobStatus] {
    match action {
        Action::SubmitBid | Action::SelectBid => &[JobStatus::Open],
        Action::FundEscrow => &[JobStatus::AwaitingPayment],
        Action::SubmitWork => &[JobStatus::InEscrow, JobStatus::RevisionRequested],
        Action::ApproveWork | Action::RequestRevision => &[JobStatus::Submitted],
        // DISPUTED needs a counterparty, so OPEN jobs cannot be disputed.
        Action::RaiseDispute => &[
            JobStatus::AwaitingPayment,
            JobStatus::InEscrow,
            JobStatus::Submitted,
            JobStatus::RevisionRequested,
        ],
    }
}

fn is_authorized(job: &Job, caller: &UserId, action: Action) -> bool {
    let is_client = &job.client_id == caller;
    let is_selected = job.selected_freelancer() == Some(caller);
    match action {
        Action::SubmitBid => !is_client,
        Action::SelectBid
        | Action::FundEscrow
        | Action::ApproveWork
        | Action::RequestRevision => is_client,
        Action::SubmitWork => is_selected,
        Action::RaiseDispute => is_client || is_selected,
    }
}

/// Check that `caller` may perform `action` on `job` right now.
///
/// Order: frozen jobs first, then authority, then status, then any ledger
/// operation still in flight.
pub fn guard(job: &Job, caller: &UserId, action: Action) -> Result<()> {
    if let Some(reason) = &job.integrity_fault {
        return Err(LifecycleError::IntegrityFault {
            job: job.id,
            reason: reason.clone(),
        });
    }
    if !is_authorized(job, caller, action) {
        return Err(LifecycleError::Forbidden {
            job: job.id,
            caller: caller.clone(),
            action,
        });
    }
    if !statuses_for(action).contains(&job.status) {
        return Err(LifecycleError::InvalidState {
            job: job.id,
            action,
            status: job.status,
        });
    }
    if let Some(intent) = &job.pending_ledger_op {
        return Err(LifecycleError::LedgerPending {
            job: job.id,
            op: intent.op,
        });
    }
    Ok(())
}

pub fn select_bid(job: &Job, bid_id: BidId) -> Result<Job> {
    if job.bid(bid_id).is_none() {
        return Err(LifecycleError::NotFound(Missing::Bid(job.id, bid_id)));
    }
    Ok(Job {
        selected_bid_id: Some(bid_id),
        status: JobStatus::AwaitingPayment,
        ..job.clone()
    })
}

pub fn submit_work(job: &Job, content: String, at: DateTime<Utc>) -> Job {
    Job {
        work_submission: Some(WorkSubmission {
            content,
            submitted_at: at,
        }),
        status: JobStatus::Submitted,
        ..job.clone()
    }
}

pub fn request_revision(job: &Job, note: String) -> Job {
    Job {
        revision_note: Some(note),
        status: JobStatus::RevisionRequested,
        ..job.clone()
    }
}

pub fn raise_dispute(job: &Job, reason: String) -> Job {
    Job {
        dispute_reason: Some(reason),
        status: JobStatus::Disputed,
        ..job.clone()
    }
}

pub fn record_intent(job: &Job, op: LedgerOp, at: DateTime<Utc>) -> Job {
    Job {
        pending_ledger_op: Some(LedgerIntent {
            op,
            tx_ref: None,
            recorded_at: at,
        }),
        ..job.clone()
    }
}

pub fn attach_intent_tx(job: &Job, tx_ref: TxRef) -> Job {
    let pending_ledger_op = job.pending_ledger_op.clone().map(|intent| LedgerIntent {
        tx_ref: Some(tx_ref),
        ..intent
    });
    Job {
        pending_ledger_op,
        ..job.clone()
    }
}

pub fn clear_intent(job: &Job) -> Job {
    Job {
        pending_ledger_op: None,
        ..job.clone()
    }
}

/// Mirror a confirmed escrow funding onto the record.
pub fn confirm_fund(job: &Job, tx_ref: TxRef) -> Result<Job> {
    if job.status != JobStatus::AwaitingPayment {
        return Err(LifecycleError::InvalidState {
            job: job.id,
            action: Action::FundEscrow,
            status: job.status,
        });
    }
    Ok(Job {
        escrow_funded: true,
        escrow_tx_ref: Some(tx_ref),
        status: JobStatus::InEscrow,
        pending_ledger_op: None,
        ..job.clone()
    })
}

/// Mirror a confirmed payment release onto the record.
pub fn confirm_release(job: &Job, tx_ref: TxRef) -> Result<Job> {
    if !matches!(job.status, JobStatus::Submitted | JobStatus::InEscrow) {
        return Err(LifecycleError::InvalidState {
            job: job.id,
            action: Action::ApproveWork,
            status: job.status,
        });
    }
    Ok(Job {
        completion_tx_ref: Some(tx_ref),
        status: JobStatus::Complete,
        pending_ledger_op: None,
        ..job.clone()
    })
}

pub fn confirm(job: &Job, op: LedgerOp, tx_ref: TxRef) -> Result<Job> {
    match op {
        LedgerOp::Fund => confirm_fund(job, tx_ref),
        LedgerOp::Release => confirm_release(job, tx_ref),
    }
}

/// Freeze the job. Status is left untouched so the divergence stays visible.
pub fn freeze(job: &Job, reason: String) -> Job {
    Job {
        integrity_fault: Some(reason),
        ..job.clone()
    }
}

pub fn unfreeze(job: &Job) -> Job {
    Job {
        integrity_fault: None,
        ..job.clone()
    }
}
