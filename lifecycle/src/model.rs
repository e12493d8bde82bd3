use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidId(pub u64);

impl Display for BidId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity issued by the auth layer. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Open,
    AwaitingPayment,
    InEscrow,
    Submitted,
    RevisionRequested,
    Complete,
    Disputed,
    Resolved,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Open,
        JobStatus::AwaitingPayment,
        JobStatus::InEscrow,
        JobStatus::Submitted,
        JobStatus::RevisionRequested,
        JobStatus::Complete,
        JobStatus::Disputed,
        JobStatus::Resolved,
    ];

    /// Statuses in which a ledger call may be outstanding or a crash may have
    /// left the record behind the ledger.
    pub const LEDGER_PENDING: [JobStatus; 3] = [
        JobStatus::AwaitingPayment,
        JobStatus::InEscrow,
        JobStatus::Submitted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Resolved)
    }

    /// Statuses that can only be reached after escrow was funded.
    pub fn requires_funding(self) -> bool {
        matches!(
            self,
            JobStatus::InEscrow
                | JobStatus::Submitted
                | JobStatus::RevisionRequested
                | JobStatus::Complete
        )
    }

    pub fn is_ledger_pending(self) -> bool {
        Self::LEDGER_PENDING.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Open => "OPEN",
            JobStatus::AwaitingPayment => "AWAITING_PAYMENT",
            JobStatus::InEscrow => "IN_ESCROW",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::RevisionRequested => "REVISION_REQUESTED",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Disputed => "DISPUTED",
            JobStatus::Resolved => "RESOLVED",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown job status {0:?}")]
pub struct ParseStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Reference to a ledger transaction kept on the record for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TxRef {
    Hash(B256),
    /// The effect is visible on the ledger but the transaction that caused it
    /// could not be found.
    Recovered,
}

const RECOVERED: &str = "recovered";

impl Display for TxRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TxRef::Hash(hash) => write!(f, "{:#}", hash),
            TxRef::Recovered => f.write_str(RECOVERED),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid transaction reference {0:?}")]
pub struct ParseTxRefError(String);

impl FromStr for TxRef {
    type Err = ParseTxRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == RECOVERED {
            return Ok(TxRef::Recovered);
        }
        B256::from_str(s)
            .map(TxRef::Hash)
            .map_err(|_| ParseTxRefError(s.to_string()))
    }
}

impl From<TxRef> for String {
    fn from(tx: TxRef) -> Self {
        tx.to_string()
    }
}

impl TryFrom<String> for TxRef {
    type Error = ParseTxRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSubmission {
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOp {
    Fund,
    Release,
}

impl Display for LedgerOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LedgerOp::Fund => f.write_str("fund"),
            LedgerOp::Release => f.write_str("release"),
        }
    }
}

/// Write-ahead marker recorded before a ledger submission. While it is set the
/// operation must be polled for, never resubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIntent {
    pub op: LedgerOp,
    pub tx_ref: Option<TxRef>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub job_id: JobId,
    pub freelancer_id: UserId,
    pub payout_address: Address,
    pub amount: U256,
    pub delivery_days: u32,
    pub proposal: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: UserId,
    pub title: String,
    pub description: String,
    pub budget: U256,
    pub deadline: DateTime<Utc>,
    pub category: String,
    pub skills: BTreeSet<String>,
    pub status: JobStatus,
    pub bids: Vec<Bid>,
    pub selected_bid_id: Option<BidId>,
    pub escrow_funded: bool,
    pub escrow_tx_ref: Option<TxRef>,
    pub completion_tx_ref: Option<TxRef>,
    pub work_submission: Option<WorkSubmission>,
    pub revision_note: Option<String>,
    pub dispute_reason: Option<String>,
    pub pending_ledger_op: Option<LedgerIntent>,
    pub integrity_fault: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Job {
    pub fn selected_bid(&self) -> Option<&Bid> {
        let id = self.selected_bid_id?;
        self.bids.iter().find(|b| b.id == id)
    }

    pub fn bid(&self, id: BidId) -> Option<&Bid> {
        self.bids.iter().find(|b| b.id == id)
    }

    pub fn bid_from(&self, freelancer: &UserId) -> Option<&Bid> {
        self.bids.iter().find(|b| &b.freelancer_id == freelancer)
    }

    pub fn selected_freelancer(&self) -> Option<&UserId> {
        self.selected_bid().map(|b| &b.freelancer_id)
    }

    pub fn is_frozen(&self) -> bool {
        self.integrity_fault.is_some()
    }

    pub fn bid_status(&self, bid: &Bid) -> BidStatus {
        match self.selected_bid_id {
            None => BidStatus::Pending,
            Some(id) if id == bid.id => BidStatus::Accepted,
            Some(_) => BidStatus::Rejected,
        }
    }

    pub fn bid_statuses(&self) -> Vec<(Bid, BidStatus)> {
        self.bids
            .iter()
            .map(|b| (b.clone(), self.bid_status(b)))
            .collect()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let violation = |what: &str| Err(InvariantViolation(self.id, what.to_string()));
        if (self.status == JobStatus::Open) != self.selected_bid_id.is_none() {
            return violation("status is OPEN exactly when no bid is selected");
        }
        if self.selected_bid_id.is_some() && self.selected_bid().is_none() {
            return violation("selected bid must exist on the job");
        }
        if self.status.requires_funding()
            && !(self.escrow_funded && self.escrow_tx_ref.is_some())
        {
            return violation("funded statuses require escrow funding and its tx ref");
        }
        if self.status == JobStatus::Complete && self.completion_tx_ref.is_none() {
            return violation("COMPLETE requires a completion tx ref");
        }
        if !self.bids.iter().map(|b| &b.freelancer_id).all_unique() {
            return violation("at most one bid per freelancer");
        }
        if self.bids.iter().any(|b| b.job_id != self.id) {
            return violation("bids belong to their job");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {0} violates invariant: {1}")]
pub struct InvariantViolation(pub JobId, pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub client_id: UserId,
    pub title: String,
    pub description: String,
    pub budget: U256,
    pub deadline: DateTime<Utc>,
    pub category: String,
    #[serde(default)]
    pub skills: BTreeSet<String>,
}

impl NewJob {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }
        if self.budget.is_zero() {
            return Err("budget must be greater than zero".into());
        }
        if self.deadline <= now {
            return Err("deadline must be in the future".into());
        }
        Ok(())
    }
}

pub const MAX_DELIVERY_DAYS: u32 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBid {
    pub payout_address: Address,
    pub amount: U256,
    pub delivery_days: u32,
    pub proposal: String,
}

impl NewBid {
    pub fn validate(&self) -> Result<(), String> {
        if self.amount.is_zero() {
            return Err("bid amount must be greater than zero".into());
        }
        if self.delivery_days == 0 {
            return Err("delivery must take at least one day".into());
        }
        if self.delivery_days > MAX_DELIVERY_DAYS {
            return Err(format!(
                "delivery cannot take more than {} days",
                MAX_DELIVERY_DAYS
            ));
        }
        if self.payout_address == Address::ZERO {
            return Err("payout address must not be the zero address".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerPhase {
    AwaitingFund,
    AwaitingDelivery,
    Complete,
    Refunded,
}

impl TryFrom<u8> for LedgerPhase {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LedgerPhase::AwaitingFund),
            1 => Ok(LedgerPhase::AwaitingDelivery),
            2 => Ok(LedgerPhase::Complete),
            3 => Ok(LedgerPhase::Refunded),
            other => Err(other),
        }
    }
}

impl Display for LedgerPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LedgerPhase::AwaitingFund => f.write_str("AWAITING_FUND"),
            LedgerPhase::AwaitingDelivery => f.write_str("AWAITING_DELIVERY"),
            LedgerPhase::Complete => f.write_str("COMPLETE"),
            LedgerPhase::Refunded => f.write_str("REFUNDED"),
        }
    }
}

/// Ledger-side projection of a job. Ground truth for custody of funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerJobState {
    pub client: Address,
    pub freelancer: Address,
    pub amount: U256,
    pub phase: LedgerPhase,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub client_id: Option<UserId>,
    #[serde(default)]
    pub freelancer_id: Option<UserId>,
}

impl JobFilter {
    pub fn with_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.client_id.as_ref().is_none_or(|c| &job.client_id == c)
            && self
                .freelancer_id
                .as_ref()
                .is_none_or(|f| job.selected_freelancer() == Some(f))
    }
}
