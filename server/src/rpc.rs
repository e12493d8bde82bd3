use escrow_api::{
    codes,
    rpc::{AdminApiServer, LifecycleApiServer},
    types::{BidView, CommandResponse, CreateJobRequest, ReconcileResponse},
};
use jsonrpsee::{
    core::async_trait,
    server::{Server, ServerHandle},
    types::{ErrorObject, ErrorObjectOwned},
    RpcModule,
};
use lifecycle::{
    BidId, Coordinator, Job, JobFilter, JobId, LedgerGateway, LifecycleError,
    NotificationEmitter, NewBid, RecordStore, Reconciler, UserId,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, instrument};

const FROZEN_MESSAGE: &str = "temporarily unavailable";

/// Map a lifecycle failure onto a JSON-RPC error. Store failures and
/// integrity faults are logged here and never shown to callers verbatim.
pub fn rpc_error(err: LifecycleError) -> ErrorObjectOwned {
    let code = match &err {
        LifecycleError::NotFound(_) => codes::NOT_FOUND,
        LifecycleError::Forbidden { .. } => codes::FORBIDDEN,
        LifecycleError::InvalidState { .. } => codes::INVALID_STATE,
        LifecycleError::DuplicateBid { .. } => codes::DUPLICATE_BID,
        LifecycleError::Conflict(_) => codes::CONFLICT,
        LifecycleError::LedgerPending { .. } => codes::LEDGER_PENDING,
        LifecycleError::LedgerUnavailable(_) => codes::LEDGER_UNAVAILABLE,
        LifecycleError::LedgerUncertain { .. } => codes::LEDGER_UNCERTAIN,
        LifecycleError::LedgerRejected(_) => codes::LEDGER_REJECTED,
        LifecycleError::Validation(_) => codes::INVALID_PARAMS,
        LifecycleError::IntegrityFault { job, reason } => {
            error!(job_id = %job, %reason, "command refused on frozen job");
            return ErrorObject::owned(
                codes::TEMPORARILY_UNAVAILABLE,
                format!("job {} is {}", job, FROZEN_MESSAGE),
                None::<()>,
            );
        }
        LifecycleError::Store(msg) => {
            error!(error = %msg, "record store failure");
            return ErrorObject::owned(codes::INTERNAL, "internal error", None::<()>);
        }
    };
    ErrorObject::owned(code, err.to_string(), None::<()>)
}

/// Fault reasons are for operators only.
fn redact(mut job: Job) -> Job {
    if job.integrity_fault.is_some() {
        job.integrity_fault = Some(FROZEN_MESSAGE.to_string());
    }
    job
}

/// User commands and queries.
pub struct LifecycleRpc<S, L, N> {
    coordinator: Coordinator<S, L, N>,
}

impl<S, L, N> LifecycleRpc<S, L, N> {
    pub fn new(coordinator: Coordinator<S, L, N>) -> Self {
        Self { coordinator }
    }
}

/// Operator actions. Only ever bound to the admin address.
pub struct AdminRpc<S, L, N> {
    coordinator: Coordinator<S, L, N>,
    reconciler: Arc<Reconciler<S, L, N>>,
}

impl<S, L, N> AdminRpc<S, L, N> {
    pub fn new(coordinator: Coordinator<S, L, N>, reconciler: Arc<Reconciler<S, L, N>>) -> Self {
        Self {
            coordinator,
            reconciler,
        }
    }
}

/// Bind a JSON-RPC server on `addr` and start serving `methods`.
pub async fn serve<T>(
    name: &str,
    addr: SocketAddr,
    methods: RpcModule<T>,
) -> anyhow::Result<(SocketAddr, ServerHandle)>
where
    T: Send + Sync + 'static,
{
    let server = Server::builder().build(addr).await?;
    let local_addr = server.local_addr()?;
    info!("{} server started at {}", name, local_addr);
    Ok((local_addr, server.start(methods)))
}

#[async_trait]
impl<S, L, N> LifecycleApiServer for LifecycleRpc<S, L, N>
where
    S: RecordStore + 'static,
    L: LedgerGateway + 'static,
    N: NotificationEmitter + 'static,
{
    async fn create_job(
        &self,
        caller: UserId,
        request: CreateJobRequest,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .create_job(request.into_new_job(caller))
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .get_job(job_id)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, ErrorObjectOwned> {
        let jobs = self
            .coordinator
            .list_jobs(&filter)
            .await
            .map_err(rpc_error)?;
        Ok(jobs.into_iter().map(redact).collect())
    }

    async fn bid_statuses(&self, job_id: JobId) -> Result<Vec<BidView>, ErrorObjectOwned> {
        let bids = self
            .coordinator
            .bid_statuses(job_id)
            .await
            .map_err(rpc_error)?;
        Ok(bids
            .into_iter()
            .map(|(bid, status)| BidView { bid, status })
            .collect())
    }

    async fn submit_bid(
        &self,
        caller: UserId,
        job_id: JobId,
        bid: NewBid,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .submit_bid(&caller, job_id, bid)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn select_bid(
        &self,
        caller: UserId,
        job_id: JobId,
        bid_id: BidId,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .select_bid(&caller, job_id, bid_id)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn fund_escrow(
        &self,
        caller: UserId,
        job_id: JobId,
    ) -> Result<CommandResponse, ErrorObjectOwned> {
        let outcome = self
            .coordinator
            .fund_escrow(&caller, job_id)
            .await
            .map_err(rpc_error)?;
        let mut response = CommandResponse::from(outcome);
        response.job = redact(response.job);
        Ok(response)
    }

    async fn submit_work(
        &self,
        caller: UserId,
        job_id: JobId,
        content: String,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .submit_work(&caller, job_id, content)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn approve_work(
        &self,
        caller: UserId,
        job_id: JobId,
    ) -> Result<CommandResponse, ErrorObjectOwned> {
        let outcome = self
            .coordinator
            .approve_work(&caller, job_id)
            .await
            .map_err(rpc_error)?;
        let mut response = CommandResponse::from(outcome);
        response.job = redact(response.job);
        Ok(response)
    }

    async fn request_revision(
        &self,
        caller: UserId,
        job_id: JobId,
        note: String,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .request_revision(&caller, job_id, note)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn raise_dispute(
        &self,
        caller: UserId,
        job_id: JobId,
        reason: String,
    ) -> Result<Job, ErrorObjectOwned> {
        self.coordinator
            .raise_dispute(&caller, job_id, reason)
            .await
            .map(redact)
            .map_err(rpc_error)
    }

    async fn health_check(&self) -> Result<(), ErrorObjectOwned> {
        Ok(())
    }
}

#[async_trait]
impl<S, L, N> AdminApiServer for AdminRpc<S, L, N>
where
    S: RecordStore + 'static,
    L: LedgerGateway + 'static,
    N: NotificationEmitter + 'static,
{
    #[instrument(skip(self))]
    async fn clear_integrity_fault(&self, job_id: JobId) -> Result<Job, ErrorObjectOwned> {
        let job = self
            .coordinator
            .clear_integrity_fault(job_id)
            .await
            .map_err(rpc_error)?;
        info!(job_id = %job.id, "integrity fault cleared by operator");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn reconcile_job(&self, job_id: JobId) -> Result<ReconcileResponse, ErrorObjectOwned> {
        self.reconciler
            .reconcile_job(job_id)
            .await
            .map(ReconcileResponse::from)
            .map_err(rpc_error)
    }
}
