use super::types::{BidView, CommandResponse, CreateJobRequest, ReconcileResponse};
use jsonrpsee::{proc_macros::rpc, types::ErrorObjectOwned};
use lifecycle::{BidId, Job, JobFilter, JobId, NewBid, UserId};

/// Commands take the caller identity as issued by the auth layer in front of
/// this service.
#[rpc(server, client)]
pub trait LifecycleApi {
    #[method(name = "createJob")]
    async fn create_job(
        &self,
        caller: UserId,
        request: CreateJobRequest,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "getJob")]
    async fn get_job(&self, job_id: JobId) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "listJobs")]
    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, ErrorObjectOwned>;

    #[method(name = "bidStatuses")]
    async fn bid_statuses(&self, job_id: JobId) -> Result<Vec<BidView>, ErrorObjectOwned>;

    #[method(name = "submitBid")]
    async fn submit_bid(
        &self,
        caller: UserId,
        job_id: JobId,
        bid: NewBid,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "selectBid")]
    async fn select_bid(
        &self,
        caller: UserId,
        job_id: JobId,
        bid_id: BidId,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "fundEscrow")]
    async fn fund_escrow(
        &self,
        caller: UserId,
        job_id: JobId,
    ) -> Result<CommandResponse, ErrorObjectOwned>;

    #[method(name = "submitWork")]
    async fn submit_work(
        &self,
        caller: UserId,
        job_id: JobId,
        content: String,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "approveWork")]
    async fn approve_work(
        &self,
        caller: UserId,
        job_id: JobId,
    ) -> Result<CommandResponse, ErrorObjectOwned>;

    #[method(name = "requestRevision")]
    async fn request_revision(
        &self,
        caller: UserId,
        job_id: JobId,
        note: String,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "raiseDispute")]
    async fn raise_dispute(
        &self,
        caller: UserId,
        job_id: JobId,
        reason: String,
    ) -> Result<Job, ErrorObjectOwned>;

    #[method(name = "healthCheck")]
    async fn health_check(&self) -> Result<(), ErrorObjectOwned>;
}

/// Operator surface. Served on its own address, never next to the user
/// commands.
#[rpc(server, client)]
pub trait AdminApi {
    /// Lift an integrity freeze once the divergence has been investigated.
    #[method(name = "clearIntegrityFault")]
    async fn clear_integrity_fault(&self, job_id: JobId) -> Result<Job, ErrorObjectOwned>;

    /// Reconcile one job against the ledger now.
    #[method(name = "reconcileJob")]
    async fn reconcile_job(&self, job_id: JobId) -> Result<ReconcileResponse, ErrorObjectOwned>;
}
