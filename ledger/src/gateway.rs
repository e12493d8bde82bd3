use crate::contract::Escrow::{self, EscrowInstance};
use alloy::{
    contract::Error as ContractError,
    network::{Ethereum, EthereumWallet},
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol_types::SolEvent,
    transports::{
        http::{Client, Http},
        RpcError,
    },
};
use lifecycle::{
    with_backoff, BackoffPolicy, JobId, LedgerError, LedgerGateway, LedgerJobState, LedgerOp,
    LedgerPhase, TxRef,
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub fn create_provider(
    node_url: Url,
    signer: PrivateKeySigner,
) -> impl Provider<Http<Client>, Ethereum> + Clone {
    let wallet = EthereumWallet::from(signer);
    ProviderBuilder::new()
        .with_recommended_fillers()
        .wallet(wallet)
        .on_http(node_url)
}

#[derive(Debug, Clone)]
pub struct EscrowGatewayConfig {
    pub contract: Address,
    /// Upper bound on waiting for a receipt once a transaction is broadcast.
    pub receipt_timeout: Duration,
    pub confirmations: u64,
    pub backoff: BackoffPolicy,
    /// First block searched when looking up past escrow events.
    pub from_block: u64,
}

impl EscrowGatewayConfig {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            receipt_timeout: Duration::from_secs(120),
            confirmations: 1,
            backoff: BackoffPolicy::default(),
            from_block: 0,
        }
    }
}

/// `LedgerGateway` backed by the on-chain escrow contract. The operator key
/// configured on the provider acts as the escrow client.
pub struct EscrowGateway<P> {
    contract: EscrowInstance<Http<Client>, P>,
    config: EscrowGatewayConfig,
}

impl<P> EscrowGateway<P>
where
    P: Provider<Http<Client>, Ethereum> + Clone,
{
    pub fn new(provider: P, config: EscrowGatewayConfig) -> Self {
        Self {
            contract: Escrow::new(config.contract, provider),
            config,
        }
    }

    pub fn address(&self) -> Address {
        self.config.contract
    }

    /// Before a retry, check whether an earlier attempt landed after all.
    async fn already_applied(&self, job: JobId, op: LedgerOp) -> Result<Option<TxRef>, LedgerError> {
        match self.query_state(job).await? {
            Some(state) if op.is_applied(&state) => {
                let tx_ref = self.find_transaction(job, op).await?.unwrap_or(TxRef::Recovered);
                info!(%job, %op, %tx_ref, "earlier attempt already landed, not resubmitting");
                Ok(Some(tx_ref))
            }
            _ => Ok(None),
        }
    }

    async fn submit(&self, job: JobId, op: LedgerOp, payee: Address, amount: U256) -> Result<TxRef, LedgerError> {
        let id = U256::from(job.0);
        let pending = match op {
            LedgerOp::Fund => self.contract.createJob(id, payee).value(amount).send().await,
            LedgerOp::Release => self.contract.releasePayment(id).send().await,
        }
        .map_err(classify_send)?;

        // From here on the transaction may be in a mempool: never retry.
        let tx_hash = *pending.tx_hash();
        debug!(%job, %op, %tx_hash, "transaction broadcast");
        let receipt = pending
            .with_required_confirmations(self.config.confirmations)
            .with_timeout(Some(self.config.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| LedgerError::Uncertain {
                tx_ref: Some(TxRef::Hash(tx_hash)),
                reason: e.to_string(),
            })?;
        if !receipt.status() {
            return Err(LedgerError::Rejected(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }
        Ok(TxRef::Hash(receipt.transaction_hash))
    }

    async fn submit_with_retry(&self, job: JobId, op: LedgerOp, payee: Address, amount: U256) -> Result<TxRef, LedgerError> {
        let label = format!("{} job {}", op, job);
        with_backoff(&self.config.backoff, &label, |attempt| async move {
            if attempt > 0 {
                if let Some(tx_ref) = self.already_applied(job, op).await? {
                    return Ok(tx_ref);
                }
            }
            self.submit(job, op, payee, amount).await
        })
        .await
    }

    async fn find_event<E: SolEvent>(
        &self,
        matches: impl Fn(&E) -> bool,
    ) -> Result<Option<TxRef>, LedgerError> {
        let logs = self
            .contract
            .event_filter::<E>()
            .from_block(self.config.from_block)
            .query()
            .await
            .map_err(classify_query)?;
        Ok(logs
            .into_iter()
            .filter(|(event, _)| matches(event))
            .filter_map(|(_, log)| log.transaction_hash)
            .last()
            .map(TxRef::Hash))
    }
}

impl<P> LedgerGateway for EscrowGateway<P>
where
    P: Provider<Http<Client>, Ethereum> + Clone,
{
    #[instrument(skip_all, fields(job_id = %job))]
    async fn fund(&self, job: JobId, payee: Address, amount: U256) -> Result<TxRef, LedgerError> {
        self.submit_with_retry(job, LedgerOp::Fund, payee, amount).await
    }

    #[instrument(skip_all, fields(job_id = %job))]
    async fn release(&self, job: JobId) -> Result<TxRef, LedgerError> {
        self.submit_with_retry(job, LedgerOp::Release, Address::ZERO, U256::ZERO)
            .await
    }

    async fn query_state(&self, job: JobId) -> Result<Option<LedgerJobState>, LedgerError> {
        let res = self
            .contract
            .getJob(U256::from(job.0))
            .call()
            .await
            .map_err(classify_query)?;
        // Unknown jobs come back zeroed.
        if res.client == Address::ZERO {
            return Ok(None);
        }
        let phase = LedgerPhase::try_from(res.state)
            .map_err(|s| LedgerError::Rejected(format!("unknown escrow state {}", s)))?;
        Ok(Some(LedgerJobState {
            client: res.client,
            freelancer: res.freelancer,
            amount: res.amount,
            phase,
            created_at: res.createdAt.saturating_to::<u64>(),
        }))
    }

    async fn find_transaction(&self, job: JobId, op: LedgerOp) -> Result<Option<TxRef>, LedgerError> {
        let id = U256::from(job.0);
        let found = match op {
            LedgerOp::Fund => {
                self.find_event::<Escrow::JobCreated>(|e| e.jobId == id)
                    .await?
            }
            LedgerOp::Release => {
                self.find_event::<Escrow::PaymentReleased>(|e| e.jobId == id)
                    .await?
            }
        };
        if found.is_none() {
            warn!(%job, %op, "no escrow event found for job");
        }
        Ok(found)
    }
}

/// Errors raised while sending. Only failures that happen before the node
/// accepted the transaction are reported as retryable.
pub(crate) fn classify_send(err: ContractError) -> LedgerError {
    match err {
        ContractError::TransportError(RpcError::ErrorResp(payload)) => {
            LedgerError::Rejected(payload.to_string())
        }
        ContractError::TransportError(e @ (RpcError::Transport(_) | RpcError::NullResp)) => {
            LedgerError::Unavailable(e.to_string())
        }
        other => LedgerError::Rejected(other.to_string()),
    }
}

/// Read-only calls have no side effects, so any failure is retryable.
pub(crate) fn classify_query(err: ContractError) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::transports::TransportErrorKind;

    #[test]
    fn transport_failures_before_acceptance_are_retryable() {
        let err = classify_send(ContractError::TransportError(RpcError::Transport(
            TransportErrorKind::BackendGone,
        )));
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }

    #[test]
    fn local_encoding_failures_are_rejections() {
        let err = classify_send(ContractError::UnknownFunction("refund".into()));
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[test]
    fn query_failures_are_always_retryable() {
        let err = classify_query(ContractError::UnknownFunction("getJob".into()));
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }
}
