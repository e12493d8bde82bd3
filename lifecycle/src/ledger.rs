use crate::model::{JobId, LedgerJobState, LedgerOp, TxRef};
use alloy::primitives::{Address, U256};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The request never reached the ledger's pending pool. Safe to retry.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// The transaction may have been submitted but inclusion is unconfirmed.
    /// Must be polled through `query_state`, never resubmitted.
    #[error("transaction outcome unknown: {reason}")]
    Uncertain {
        tx_ref: Option<TxRef>,
        reason: String,
    },
    /// The ledger refused the transaction; nothing changed on-chain.
    #[error("ledger rejected the request: {0}")]
    Rejected(String),
}

/// Adapter over the escrow ledger. `fund` and `release` return once the
/// transaction is included.
pub trait LedgerGateway: Send + Sync {
    fn fund(
        &self,
        job: JobId,
        payee: Address,
        amount: U256,
    ) -> impl Future<Output = Result<TxRef, LedgerError>> + Send;

    fn release(&self, job: JobId) -> impl Future<Output = Result<TxRef, LedgerError>> + Send;

    /// `None` when the ledger has no record of the job.
    fn query_state(
        &self,
        job: JobId,
    ) -> impl Future<Output = Result<Option<LedgerJobState>, LedgerError>> + Send;

    /// Look up the transaction that applied `op` for `job`, if it landed.
    fn find_transaction(
        &self,
        job: JobId,
        op: LedgerOp,
    ) -> impl Future<Output = Result<Option<TxRef>, LedgerError>> + Send;
}
