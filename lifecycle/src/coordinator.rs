//! Command handling for the job lifecycle.
//!
//! Each command reads the job, checks the transition table, and commits the
//! next state with a version-guarded write. Ledger-backed commands
//! (`fund_escrow`, `approve_work`) record a write-ahead intent first, so a
//! submission is never repeated once its outcome is uncertain.

use crate::{
    error::{Action, LifecycleError, Result},
    ledger::{LedgerError, LedgerGateway},
    machine,
    model::{
        Bid, BidId, BidStatus, Job, JobFilter, JobId, JobStatus, LedgerOp, NewBid, NewJob, TxRef,
        UserId,
    },
    notify::{emit_logged, EventKind, LifecycleEvent, NotificationEmitter},
    reconcile::{assess, freeze_job, Reconciler, ReconcilerConfig, Repair},
    store::{RecordStore, StoreError},
};
use alloy::primitives::{Address, U256};
use chrono::Utc;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a command waits for ledger inclusion before answering
    /// `Pending`.
    pub ledger_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ledger_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a ledger-backed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The ledger confirmed and the record reflects it.
    Committed(Job),
    /// The ledger call is in flight or its outcome is unknown. The record
    /// still shows the pre-transition status and will be updated by
    /// reconciliation.
    Pending(Job),
}

impl Outcome {
    pub fn job(&self) -> &Job {
        match self {
            Outcome::Committed(job) | Outcome::Pending(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Outcome::Committed(job) | Outcome::Pending(job) => job,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }
}

pub struct Coordinator<S, L, N> {
    store: Arc<S>,
    ledger: Arc<L>,
    notifier: Arc<N>,
    config: CoordinatorConfig,
}

impl<S, L, N> Clone for Coordinator<S, L, N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, L, N> Coordinator<S, L, N>
where
    S: RecordStore,
    L: LedgerGateway,
    N: NotificationEmitter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, notifier: Arc<N>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            ledger,
            notifier,
            config,
        }
    }

    /// A reconciler sharing this coordinator's store, ledger and emitter.
    pub fn reconciler(&self, config: ReconcilerConfig) -> Reconciler<S, L, N> {
        Reconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            self.notifier.clone(),
            config,
        )
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        new.validate(Utc::now()).map_err(LifecycleError::Validation)?;
        let job = self
            .store
            .insert(new, Utc::now())
            .await
            .map_err(|e| LifecycleError::from_store(JobId(0), e))?;
        info!(job_id = %job.id, client_id = %job.client_id, "job created");
        self.emit(
            EventKind::JobCreated,
            &job,
            json!({ "client_id": job.client_id, "title": job.title, "budget": job.budget }),
        )
        .await;
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.store
            .get(id)
            .await
            .map_err(|e| LifecycleError::from_store(id, e))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store
            .list(filter)
            .await
            .map_err(|e| LifecycleError::from_store(JobId(0), e))
    }

    pub async fn bid_statuses(&self, id: JobId) -> Result<Vec<(Bid, BidStatus)>> {
        Ok(self.get_job(id).await?.bid_statuses())
    }

    pub async fn submit_bid(&self, caller: &UserId, job_id: JobId, bid: NewBid) -> Result<Job> {
        bid.validate().map_err(LifecycleError::Validation)?;
        let job = self.get_job(job_id).await?;
        machine::guard(&job, caller, Action::SubmitBid)?;
        if job.bid_from(caller).is_some() {
            return Err(LifecycleError::DuplicateBid {
                job: job_id,
                freelancer: caller.clone(),
            });
        }
        let job = self
            .store
            .append_bid(job_id, caller.clone(), bid, Utc::now())
            .await
            .map_err(|e| LifecycleError::from_store(job_id, e))?;
        if let Some(bid) = job.bid_from(caller) {
            info!(%job_id, bid_id = %bid.id, freelancer_id = %caller, "bid received");
            self.emit(
                EventKind::BidReceived,
                &job,
                json!({ "bid_id": bid.id, "freelancer_id": caller, "amount": bid.amount }),
            )
            .await;
        }
        Ok(job)
    }

    pub async fn select_bid(&self, caller: &UserId, job_id: JobId, bid_id: BidId) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        machine::guard(&job, caller, Action::SelectBid)?;
        let job = self.commit(&job, machine::select_bid(&job, bid_id)?).await?;
        info!(%job_id, %bid_id, "bid selected");
        self.emit(
            EventKind::BidSelected,
            &job,
            json!({ "bid_id": bid_id, "freelancer_id": job.selected_freelancer() }),
        )
        .await;
        Ok(job)
    }

    pub async fn fund_escrow(&self, caller: &UserId, job_id: JobId) -> Result<Outcome> {
        self.ledger_command(caller, job_id, Action::FundEscrow, LedgerOp::Fund)
            .await
    }

    pub async fn submit_work(&self, caller: &UserId, job_id: JobId, content: String) -> Result<Job> {
        if content.trim().is_empty() {
            return Err(LifecycleError::Validation("work submission is empty".into()));
        }
        let job = self.get_job(job_id).await?;
        machine::guard(&job, caller, Action::SubmitWork)?;
        let job = self
            .commit(&job, machine::submit_work(&job, content, Utc::now()))
            .await?;
        info!(%job_id, "work submitted");
        self.emit(EventKind::WorkSubmitted, &job, json!({ "freelancer_id": caller }))
            .await;
        Ok(job)
    }

    pub async fn approve_work(&self, caller: &UserId, job_id: JobId) -> Result<Outcome> {
        self.ledger_command(caller, job_id, Action::ApproveWork, LedgerOp::Release)
            .await
    }

    pub async fn request_revision(&self, caller: &UserId, job_id: JobId, note: String) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        machine::guard(&job, caller, Action::RequestRevision)?;
        let job = self
            .commit(&job, machine::request_revision(&job, note.clone()))
            .await?;
        info!(%job_id, "revision requested");
        self.emit(EventKind::RevisionRequested, &job, json!({ "note": note }))
            .await;
        Ok(job)
    }

    pub async fn raise_dispute(&self, caller: &UserId, job_id: JobId, reason: String) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        machine::guard(&job, caller, Action::RaiseDispute)?;
        let job = self
            .commit(&job, machine::raise_dispute(&job, reason.clone()))
            .await?;
        warn!(%job_id, raised_by = %caller, "dispute raised: {}", reason);
        self.emit(
            EventKind::DisputeRaised,
            &job,
            json!({ "raised_by": caller, "reason": reason }),
        )
        .await;
        Ok(job)
    }

    /// Operator action: lift an integrity freeze once the divergence has been
    /// investigated.
    pub async fn clear_integrity_fault(&self, job_id: JobId) -> Result<Job> {
        let job = self.get_job(job_id).await?;
        let Some(reason) = &job.integrity_fault else {
            return Ok(job);
        };
        warn!(%job_id, "clearing integrity fault: {}", reason);
        self.commit(&job, machine::unfreeze(&job)).await
    }

    async fn ledger_command(
        &self,
        caller: &UserId,
        job_id: JobId,
        action: Action,
        op: LedgerOp,
    ) -> Result<Outcome> {
        let job = self.get_job(job_id).await?;
        match machine::guard(&job, caller, action) {
            Ok(()) => {}
            // The same operation is already in flight; report it instead of
            // submitting again.
            Err(LifecycleError::LedgerPending { op: pending, .. }) if pending == op => {
                return Ok(Outcome::Pending(job))
            }
            Err(e) => return Err(e),
        }
        let span = info_span!("ledger_op", %job_id, %op);
        self.run_ledger_op(job, op).instrument(span).await
    }

    async fn run_ledger_op(&self, job: Job, op: LedgerOp) -> Result<Outcome> {
        let transfer = match op {
            LedgerOp::Fund => {
                let bid = job.selected_bid().ok_or(LifecycleError::InvalidState {
                    job: job.id,
                    action: Action::FundEscrow,
                    status: job.status,
                })?;
                Some((bid.payout_address, bid.amount))
            }
            LedgerOp::Release => None,
        };

        // The effect may already be on the ledger if an earlier attempt
        // landed after its caller gave up. The guard rules out an in-flight
        // intent, so there is nothing here to expire.
        let observed = self
            .ledger
            .query_state(job.id)
            .await
            .map_err(|e| LifecycleError::from_ledger(job.id, e))?;
        match assess(&job, observed.as_ref(), Utc::now(), Duration::MAX) {
            Repair::Nothing(_) | Repair::ExpireIntent => {}
            Repair::Confirm(applied) => {
                let tx_ref = self.lookup_tx(job.id, applied).await;
                debug!(%tx_ref, "ledger already applied the operation");
                let job = self
                    .commit(&job, machine::confirm(&job, applied, tx_ref)?)
                    .await?;
                self.emit_settled(&job, applied, false).await;
                return Ok(Outcome::Committed(job));
            }
            Repair::Freeze(reason) => {
                freeze_job(&*self.store, &*self.notifier, &job, &reason, observed.as_ref()).await?;
                return Err(LifecycleError::IntegrityFault { job: job.id, reason });
            }
        }

        let marked = self
            .commit(&job, machine::record_intent(&job, op, Utc::now()))
            .await?;
        self.emit(EventKind::LedgerPending, &marked, json!({ "op": op }))
            .await;

        let submission = tokio::time::timeout(self.config.ledger_timeout, self.submit(&marked, transfer));
        match submission.await {
            Ok(Ok(tx_ref)) => self.settle(marked, op, tx_ref).await,
            Ok(Err(LedgerError::Uncertain { tx_ref, reason })) => {
                warn!(?tx_ref, "ledger outcome unknown, leaving intent in place: {}", reason);
                let job = match tx_ref {
                    Some(tx_ref) => self
                        .commit(&marked, machine::attach_intent_tx(&marked, tx_ref))
                        .await
                        .unwrap_or(marked),
                    None => marked,
                };
                Ok(Outcome::Pending(job))
            }
            Ok(Err(e)) => {
                warn!("ledger refused the submission: {}", e);
                if let Err(clear) = self.commit(&marked, machine::clear_intent(&marked)).await {
                    warn!("could not clear ledger intent, reconciliation will expire it: {}", clear);
                }
                Err(LifecycleError::from_ledger(marked.id, e))
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.ledger_timeout.as_millis() as u64,
                    "ledger confirmation timed out"
                );
                Ok(Outcome::Pending(marked))
            }
        }
    }

    async fn submit(&self, job: &Job, transfer: Option<(Address, U256)>) -> Result<TxRef, LedgerError> {
        match transfer {
            Some((payee, amount)) => self.ledger.fund(job.id, payee, amount).await,
            None => self.ledger.release(job.id).await,
        }
    }

    /// Commit a confirmed ledger operation. A lost race here is not an error:
    /// the ledger already moved, so the caller gets whatever the winner left.
    async fn settle(&self, marked: Job, op: LedgerOp, tx_ref: TxRef) -> Result<Outcome> {
        let next = machine::confirm(&marked, op, tx_ref)?;
        match self.store.compare_and_set(marked.id, marked.version, next).await {
            Ok(job) => {
                self.emit_settled(&job, op, false).await;
                Ok(Outcome::Committed(job))
            }
            Err(StoreError::Conflict { .. }) => {
                let current = self.get_job(marked.id).await?;
                debug!(version = current.version, "record moved while the ledger confirmed");
                if is_settled(&current, op) {
                    Ok(Outcome::Committed(current))
                } else {
                    Ok(Outcome::Pending(current))
                }
            }
            Err(e) => Err(LifecycleError::from_store(marked.id, e)),
        }
    }

    async fn lookup_tx(&self, job: JobId, op: LedgerOp) -> TxRef {
        match self.ledger.find_transaction(job, op).await {
            Ok(Some(tx_ref)) => tx_ref,
            Ok(None) => TxRef::Recovered,
            Err(e) => {
                warn!(%job, %op, "transaction lookup failed: {}", e);
                TxRef::Recovered
            }
        }
    }

    async fn commit(&self, read: &Job, next: Job) -> Result<Job> {
        self.store
            .compare_and_set(read.id, read.version, next)
            .await
            .map_err(|e| LifecycleError::from_store(read.id, e))
    }

    async fn emit_settled(&self, job: &Job, op: LedgerOp, recovered: bool) {
        let (kind, tx_ref) = match op {
            LedgerOp::Fund => (EventKind::EscrowFunded, job.escrow_tx_ref),
            LedgerOp::Release => (EventKind::PaymentReleased, job.completion_tx_ref),
        };
        info!(job_id = %job.id, ?tx_ref, "{}", kind);
        self.emit(kind, job, settled_payload(job, tx_ref, recovered))
            .await;
    }

    async fn emit(&self, kind: EventKind, job: &Job, payload: Value) {
        emit_logged(&*self.notifier, LifecycleEvent::new(kind, job.id, payload)).await;
    }
}

pub(crate) fn settled_payload(job: &Job, tx_ref: Option<TxRef>, recovered: bool) -> Value {
    let bid = job.selected_bid();
    json!({
        "tx_ref": tx_ref,
        "freelancer_id": bid.map(|b| &b.freelancer_id),
        "amount": bid.map(|b| b.amount),
        "recovered": recovered,
    })
}

fn is_settled(job: &Job, op: LedgerOp) -> bool {
    match op {
        LedgerOp::Fund => job.escrow_funded,
        LedgerOp::Release => job.status == JobStatus::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Missing,
        model::{LedgerJobState, LedgerPhase},
        notify::spawn_forwarder,
        store::MemoryStore,
        test_utils::{ether_tenths, fixture_bid, fixture_job, FakeLedger, LedgerScript, RecordingEmitter},
    };

    type TestCoordinator = Coordinator<MemoryStore, FakeLedger, RecordingEmitter>;

    fn coordinator() -> (TestCoordinator, Arc<FakeLedger>, Arc<RecordingEmitter>) {
        let ledger = Arc::new(FakeLedger::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let coordinator = Coordinator::new(
            Arc::new(MemoryStore::new()),
            ledger.clone(),
            emitter.clone(),
            CoordinatorConfig {
                ledger_timeout: Duration::from_millis(200),
            },
        );
        (coordinator, ledger, emitter)
    }

    fn client() -> UserId {
        "client".into()
    }

    fn f1() -> UserId {
        "f1".into()
    }

    async fn awaiting_payment(c: &TestCoordinator) -> Job {
        let job = c.create_job(fixture_job("client")).await.unwrap();
        let job = c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
        let bid = job.bids[0].id;
        c.select_bid(&client(), job.id, bid).await.unwrap()
    }

    #[tokio::test]
    async fn happy_path_from_open_to_complete() {
        let (c, ledger, emitter) = coordinator();
        let job = c.create_job(fixture_job("client")).await.unwrap();
        assert_eq!(job.status, JobStatus::Open);
        assert_eq!(job.budget, ether_tenths(20));

        let bid = NewBid {
            amount: ether_tenths(15),
            delivery_days: 5,
            ..fixture_bid(1)
        };
        let job = c.submit_bid(&f1(), job.id, bid).await.unwrap();
        let bid_id = job.bids[0].id;

        let job = c.select_bid(&client(), job.id, bid_id).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingPayment);
        assert_eq!(job.selected_bid_id, Some(bid_id));

        let job = c.fund_escrow(&client(), job.id).await.unwrap();
        let Outcome::Committed(job) = job else {
            panic!("funding should commit");
        };
        assert_eq!(job.status, JobStatus::InEscrow);
        assert!(job.escrow_funded);
        assert_eq!(job.escrow_tx_ref, ledger.tx_for(job.id, LedgerOp::Fund));
        assert_eq!(ledger.state_of(job.id).unwrap().amount, ether_tenths(15));

        let job = c.submit_work(&f1(), job.id, "done".into()).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);

        let job = c.approve_work(&client(), job.id).await.unwrap().into_job();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completion_tx_ref.is_some());
        assert!(job.pending_ledger_op.is_none());
        job.check_invariants().unwrap();

        assert_eq!(
            emitter.kinds(),
            vec![
                EventKind::JobCreated,
                EventKind::BidReceived,
                EventKind::BidSelected,
                EventKind::LedgerPending,
                EventKind::EscrowFunded,
                EventKind::WorkSubmitted,
                EventKind::LedgerPending,
                EventKind::PaymentReleased,
            ]
        );
    }

    #[tokio::test]
    async fn revision_cycle_does_not_corrupt_state() {
        let (c, _, _) = coordinator();
        let job = awaiting_payment(&c).await;
        c.fund_escrow(&client(), job.id).await.unwrap();
        c.submit_work(&f1(), job.id, "draft".into()).await.unwrap();

        let job = c
            .request_revision(&client(), job.id, "needs tests".into())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::RevisionRequested);
        assert_eq!(job.revision_note.as_deref(), Some("needs tests"));

        let job = c.submit_work(&f1(), job.id, "with tests".into()).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.work_submission.as_ref().unwrap().content, "with tests");

        let outcome = c.approve_work(&client(), job.id).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::Complete);
        outcome.job().check_invariants().unwrap();
    }

    #[tokio::test]
    async fn funding_twice_is_rejected_without_resubmitting() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        c.fund_escrow(&client(), job.id).await.unwrap();
        assert_eq!(ledger.submissions().len(), 1);

        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                status: JobStatus::InEscrow,
                ..
            }
        ));
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn commands_check_authority_and_existence() {
        let (c, _, _) = coordinator();
        let job = c.create_job(fixture_job("client")).await.unwrap();

        let err = c.submit_bid(&client(), job.id, fixture_bid(1)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Forbidden { .. }));

        let job = c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
        let err = c.select_bid(&f1(), job.id, job.bids[0].id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Forbidden { .. }));

        let err = c.select_bid(&client(), job.id, BidId(99)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(Missing::Bid(_, BidId(99)))));

        let err = c.get_job(JobId(42)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(Missing::Job(JobId(42)))));
    }

    #[tokio::test]
    async fn a_freelancer_bids_once() {
        let (c, _, _) = coordinator();
        let job = c.create_job(fixture_job("client")).await.unwrap();
        c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
        let err = c.submit_bid(&f1(), job.id, fixture_bid(2)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateBid { .. }));

        let err = c
            .submit_bid(&"f2".into(), job.id, NewBid { delivery_days: 0, ..fixture_bid(2) })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[tokio::test]
    async fn bid_statuses_follow_the_selection() {
        let (c, _, _) = coordinator();
        let job = c.create_job(fixture_job("client")).await.unwrap();
        c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
        let job = c.submit_bid(&"f2".into(), job.id, fixture_bid(2)).await.unwrap();
        assert!(c
            .bid_statuses(job.id)
            .await
            .unwrap()
            .iter()
            .all(|(_, s)| *s == BidStatus::Pending));

        c.select_bid(&client(), job.id, job.bids[1].id).await.unwrap();
        let statuses: Vec<_> = c
            .bid_statuses(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|(b, s)| (b.freelancer_id.0, s))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("f1".to_string(), BidStatus::Rejected),
                ("f2".to_string(), BidStatus::Accepted)
            ]
        );
    }

    #[tokio::test]
    async fn unavailable_ledger_clears_the_intent() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        ledger.script([LedgerScript::Unavailable]);

        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(err.is_retryable());
        let job = c.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingPayment);
        assert!(job.pending_ledger_op.is_none());

        let outcome = c.fund_escrow(&client(), job.id).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::InEscrow);
    }

    #[tokio::test]
    async fn uncertain_outcome_is_pending_and_never_resubmitted() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        ledger.script([LedgerScript::LandUncertain]);

        let outcome = c.fund_escrow(&client(), job.id).await.unwrap();
        assert!(outcome.is_pending());
        let job = outcome.into_job();
        assert_eq!(job.status, JobStatus::AwaitingPayment);
        assert!(!job.escrow_funded);
        let intent = job.pending_ledger_op.clone().unwrap();
        assert_eq!(intent.op, LedgerOp::Fund);
        assert_eq!(intent.tx_ref, ledger.tx_for(job.id, LedgerOp::Fund));

        // A retry observes the intent and answers Pending again.
        let again = c.fund_escrow(&client(), job.id).await.unwrap();
        assert!(again.is_pending());
        assert_eq!(ledger.submissions().len(), 1);

        // Other commands see the in-flight operation.
        let err = c.raise_dispute(&client(), job.id, "slow".into()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LedgerPending { op: LedgerOp::Fund, .. }));
    }

    #[tokio::test]
    async fn slow_ledger_answers_pending_instead_of_blocking() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        ledger.set_confirm_delay(Duration::from_secs(5));

        let outcome = c.fund_escrow(&client(), job.id).await.unwrap();
        assert!(outcome.is_pending());
        assert_eq!(outcome.job().status, JobStatus::AwaitingPayment);
        assert_eq!(
            ledger.state_of(job.id).map(|s| s.phase),
            Some(LedgerPhase::AwaitingDelivery)
        );
    }

    #[tokio::test]
    async fn ledger_rejection_surfaces_and_clears_the_intent() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        ledger.script([LedgerScript::Reject]);

        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LedgerRejected(_)));
        assert!(!err.is_retryable());
        assert!(c.get_job(job.id).await.unwrap().pending_ledger_op.is_none());
    }

    #[tokio::test]
    async fn already_applied_ledger_effect_commits_without_submitting() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        let bid = job.selected_bid().unwrap().clone();
        ledger
            .fund(job.id, bid.payout_address, bid.amount)
            .await
            .unwrap();
        let submitted = ledger.submissions().len();

        let outcome = c.fund_escrow(&client(), job.id).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::InEscrow);
        assert_eq!(outcome.job().escrow_tx_ref, ledger.tx_for(job.id, LedgerOp::Fund));
        assert_eq!(ledger.submissions().len(), submitted);
    }

    #[tokio::test]
    async fn settled_or_refunded_escrow_is_never_recorded_as_funded() {
        let (c, ledger, emitter) = coordinator();
        for phase in [LedgerPhase::Refunded, LedgerPhase::Complete] {
            let job = awaiting_payment(&c).await;
            let bid = job.selected_bid().unwrap().clone();
            ledger.force_state(
                job.id,
                Some(LedgerJobState {
                    client: Address::repeat_byte(0xc1),
                    freelancer: bid.payout_address,
                    amount: bid.amount,
                    phase,
                    created_at: 0,
                }),
            );

            let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
            assert!(matches!(err, LifecycleError::IntegrityFault { .. }), "{:?}", err);
            let job = c.get_job(job.id).await.unwrap();
            assert_eq!(job.status, JobStatus::AwaitingPayment);
            assert!(!job.escrow_funded);
            assert!(job.escrow_tx_ref.is_none());
            assert!(job.is_frozen());
        }
        assert!(ledger.submissions().is_empty());
        assert!(!emitter.kinds().contains(&EventKind::EscrowFunded));
    }

    #[tokio::test]
    async fn mismatched_escrow_freezes_the_job_and_alerts() {
        let (c, ledger, emitter) = coordinator();
        let job = awaiting_payment(&c).await;
        let bid = job.selected_bid().unwrap().clone();
        ledger
            .fund(job.id, Address::repeat_byte(0x99), bid.amount)
            .await
            .unwrap();
        let submitted = ledger.submissions().len();

        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::IntegrityFault { .. }));
        assert!(c.get_job(job.id).await.unwrap().is_frozen());
        let alerts: Vec<_> = emitter
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::IntegrityFault)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].job_id, job.id);

        // Frozen jobs are refused before the ledger is consulted again.
        ledger.fail_queries(1);
        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::IntegrityFault { .. }));
        assert_eq!(ledger.submissions().len(), submitted);
    }

    #[tokio::test]
    async fn unreachable_ledger_query_does_not_submit() {
        let (c, ledger, _) = coordinator();
        let job = awaiting_payment(&c).await;
        ledger.fail_queries(1);

        let err = c.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::LedgerUnavailable(_)));
        assert!(ledger.submissions().is_empty());
        assert!(c.get_job(job.id).await.unwrap().pending_ledger_op.is_none());
    }

    #[tokio::test]
    async fn emitter_failures_never_fail_commands() {
        let (c, _, emitter) = coordinator();
        emitter.set_failing(true);
        let job = awaiting_payment(&c).await;
        let outcome = c.fund_escrow(&client(), job.id).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::InEscrow);
        assert!(emitter.events().is_empty());
    }

    struct SlowEmitter {
        delay: Duration,
        inner: Arc<RecordingEmitter>,
    }

    impl NotificationEmitter for SlowEmitter {
        async fn emit(&self, event: LifecycleEvent) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.emit(event).await
        }
    }

    #[tokio::test]
    async fn slow_event_sinks_do_not_hold_up_commands() {
        let recorded = Arc::new(RecordingEmitter::new());
        let (emitter, _forwarder) = spawn_forwarder(SlowEmitter {
            delay: Duration::from_secs(2),
            inner: recorded.clone(),
        });
        let c = Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeLedger::new()),
            Arc::new(emitter),
            CoordinatorConfig::default(),
        );

        let job = tokio::time::timeout(
            Duration::from_millis(500),
            c.create_job(fixture_job("client")),
        )
        .await
        .expect("create_job waited on the event sink")
        .unwrap();
        assert!(recorded.events().is_empty());

        tokio::time::timeout(Duration::from_secs(10), async {
            while recorded.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("event was never delivered");
        assert_eq!(recorded.events()[0].job_id, job.id);
    }

    #[tokio::test]
    async fn disputes_freeze_the_job() {
        let (c, _, _) = coordinator();
        let job = awaiting_payment(&c).await;
        c.fund_escrow(&client(), job.id).await.unwrap();
        let job = c
            .raise_dispute(&f1(), job.id, "client unresponsive".into())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Disputed);

        let err = c.submit_work(&f1(), job.id, "late".into()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
        let err = c.raise_dispute(&client(), job.id, "again".into()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn list_jobs_returns_newest_first() {
        let (c, _, _) = coordinator();
        let a = c.create_job(fixture_job("client")).await.unwrap();
        let b = c.create_job(fixture_job("other")).await.unwrap();
        let all = c.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let mine = c
            .list_jobs(&JobFilter {
                client_id: Some(client()),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);
    }

    #[tokio::test]
    async fn creation_is_validated() {
        let (c, _, _) = coordinator();
        let err = c
            .create_job(NewJob {
                budget: U256::ZERO,
                ..fixture_job("client")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selections_commit_exactly_one() {
        let (c, _, _) = coordinator();
        for _ in 0..20 {
            let job = c.create_job(fixture_job("client")).await.unwrap();
            c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
            let job = c.submit_bid(&"f2".into(), job.id, fixture_bid(2)).await.unwrap();

            let handles: Vec<_> = job
                .bids
                .iter()
                .map(|bid| {
                    let (c, job_id, bid_id) = (c.clone(), job.id, bid.id);
                    tokio::spawn(async move { c.select_bid(&client(), job_id, bid_id).await })
                })
                .collect();
            let mut committed = 0;
            for result in futures::future::join_all(handles).await {
                match result.unwrap() {
                    Ok(_) => committed += 1,
                    Err(LifecycleError::Conflict(_)) | Err(LifecycleError::InvalidState { .. }) => {}
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            assert_eq!(committed, 1);

            let job = c.get_job(job.id).await.unwrap();
            assert_eq!(job.status, JobStatus::AwaitingPayment);
            // create, two bids, one selection
            assert_eq!(job.version, 4);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn approval_racing_a_revision_commits_exactly_one() {
        let (c, ledger, _) = coordinator();
        let lost = |e: &LifecycleError| {
            matches!(
                e,
                LifecycleError::Conflict(_)
                    | LifecycleError::InvalidState { .. }
                    | LifecycleError::LedgerPending { .. }
            )
        };
        for _ in 0..20 {
            let job = awaiting_payment(&c).await;
            c.fund_escrow(&client(), job.id).await.unwrap();
            c.submit_work(&f1(), job.id, "draft".into()).await.unwrap();

            let approve = {
                let (c, job_id) = (c.clone(), job.id);
                tokio::spawn(async move { c.approve_work(&client(), job_id).await })
            };
            let revise = {
                let (c, job_id) = (c.clone(), job.id);
                tokio::spawn(async move {
                    c.request_revision(&client(), job_id, "more tests".into())
                        .await
                })
            };
            let (approved, revised) = (approve.await.unwrap(), revise.await.unwrap());

            let job = c.get_job(job.id).await.unwrap();
            match (approved, revised) {
                (Ok(outcome), Err(e)) => {
                    assert!(lost(&e), "unexpected error {:?}", e);
                    assert_eq!(outcome.job().status, JobStatus::Complete);
                    assert_eq!(job.status, JobStatus::Complete);
                }
                (Err(e), Ok(_)) => {
                    assert!(lost(&e), "unexpected error {:?}", e);
                    assert_eq!(job.status, JobStatus::RevisionRequested);
                }
                (approved, revised) => {
                    panic!("expected exactly one commit, got {:?} and {:?}", approved, revised)
                }
            }
            job.check_invariants().unwrap();
            let released = ledger.submissions().contains(&(job.id, LedgerOp::Release));
            assert_eq!(released, job.status == JobStatus::Complete);
        }
    }
}
