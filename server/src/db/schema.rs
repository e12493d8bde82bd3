use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use lifecycle::{
    Bid, BidId, Job, JobId, JobStatus, LedgerIntent, StoreError, TxRef, UserId, WorkSubmission,
};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, Type};
use std::str::FromStr;

// Custom type for JobStatus to map to PostgreSQL ENUM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum DbJobStatus {
    Open,
    AwaitingPayment,
    InEscrow,
    Submitted,
    RevisionRequested,
    Complete,
    Disputed,
    Resolved,
}

impl From<JobStatus> for DbJobStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Open => DbJobStatus::Open,
            JobStatus::AwaitingPayment => DbJobStatus::AwaitingPayment,
            JobStatus::InEscrow => DbJobStatus::InEscrow,
            JobStatus::Submitted => DbJobStatus::Submitted,
            JobStatus::RevisionRequested => DbJobStatus::RevisionRequested,
            JobStatus::Complete => DbJobStatus::Complete,
            JobStatus::Disputed => DbJobStatus::Disputed,
            JobStatus::Resolved => DbJobStatus::Resolved,
        }
    }
}

impl From<DbJobStatus> for JobStatus {
    fn from(status: DbJobStatus) -> Self {
        match status {
            DbJobStatus::Open => JobStatus::Open,
            DbJobStatus::AwaitingPayment => JobStatus::AwaitingPayment,
            DbJobStatus::InEscrow => JobStatus::InEscrow,
            DbJobStatus::Submitted => JobStatus::Submitted,
            DbJobStatus::RevisionRequested => JobStatus::RevisionRequested,
            DbJobStatus::Complete => JobStatus::Complete,
            DbJobStatus::Disputed => JobStatus::Disputed,
            DbJobStatus::Resolved => JobStatus::Resolved,
        }
    }
}

// Jobs table representation
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub client_id: String,
    pub title: String,
    pub description: String,
    pub budget: Vec<u8>,
    pub deadline: DateTime<Utc>,
    pub category: String,
    pub skills: Vec<String>,
    pub status: DbJobStatus,
    pub selected_bid_id: Option<i64>,
    pub escrow_funded: bool,
    pub escrow_tx_ref: Option<String>,
    pub completion_tx_ref: Option<String>,
    pub work_content: Option<String>,
    pub work_submitted_at: Option<DateTime<Utc>>,
    pub revision_note: Option<String>,
    pub dispute_reason: Option<String>,
    pub pending_ledger_op: Option<Json<LedgerIntent>>,
    pub integrity_fault: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

// Bids table representation
#[derive(Debug, FromRow)]
pub struct BidRow {
    pub id: i64,
    pub job_id: i64,
    pub freelancer_id: String,
    pub payout_address: Vec<u8>,
    pub amount: Vec<u8>,
    pub delivery_days: i32,
    pub proposal: String,
    pub created_at: DateTime<Utc>,
}

fn corrupt(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("corrupt {} in row {}", what, id))
}

pub fn encode_u256(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

fn decode_u256(bytes: &[u8], what: &str, id: i64) -> Result<U256, StoreError> {
    U256::try_from_be_slice(bytes).ok_or_else(|| corrupt(what, id))
}

fn decode_tx_ref(s: Option<String>, id: i64) -> Result<Option<TxRef>, StoreError> {
    s.map(|s| TxRef::from_str(&s).map_err(|_| corrupt("tx ref", id)))
        .transpose()
}

impl TryFrom<BidRow> for Bid {
    type Error = StoreError;

    fn try_from(row: BidRow) -> Result<Self, Self::Error> {
        Ok(Bid {
            id: BidId(row.id as u64),
            job_id: JobId(row.job_id as u64),
            freelancer_id: UserId(row.freelancer_id),
            payout_address: Address::try_from(row.payout_address.as_slice())
                .map_err(|_| corrupt("payout address", row.id))?,
            amount: decode_u256(&row.amount, "bid amount", row.id)?,
            delivery_days: u32::try_from(row.delivery_days)
                .map_err(|_| corrupt("delivery days", row.id))?,
            proposal: row.proposal,
            created_at: row.created_at,
        })
    }
}

impl JobRow {
    pub fn into_job(self, bids: Vec<Bid>) -> Result<Job, StoreError> {
        let id = self.id;
        let work_submission = match (self.work_content, self.work_submitted_at) {
            (Some(content), Some(submitted_at)) => Some(WorkSubmission {
                content,
                submitted_at,
            }),
            _ => None,
        };
        Ok(Job {
            id: JobId(id as u64),
            client_id: UserId(self.client_id),
            title: self.title,
            description: self.description,
            budget: decode_u256(&self.budget, "budget", id)?,
            deadline: self.deadline,
            category: self.category,
            skills: self.skills.into_iter().collect(),
            status: self.status.into(),
            bids,
            selected_bid_id: self.selected_bid_id.map(|b| BidId(b as u64)),
            escrow_funded: self.escrow_funded,
            escrow_tx_ref: decode_tx_ref(self.escrow_tx_ref, id)?,
            completion_tx_ref: decode_tx_ref(self.completion_tx_ref, id)?,
            work_submission,
            revision_note: self.revision_note,
            dispute_reason: self.dispute_reason,
            pending_ledger_op: self.pending_ledger_op.map(|Json(intent)| intent),
            integrity_fault: self.integrity_fault,
            created_at: self.created_at,
            version: self.version as u64,
        })
    }
}
