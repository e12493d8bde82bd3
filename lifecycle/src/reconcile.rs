//! Background healing of divergence between the record store and the ledger.
//!
//! The reconciler scans jobs whose status leaves room for an outstanding or
//! lost ledger commit, compares them with `LedgerGateway::query_state`, and
//! repairs them with the same version-guarded write the coordinator uses.
//! Divergences that cannot be explained by a lost commit freeze the job.

use crate::{
    coordinator::settled_payload,
    error::{LifecycleError, Result},
    ledger::LedgerGateway,
    machine,
    model::{Job, JobFilter, JobId, JobStatus, LedgerJobState, LedgerOp, LedgerPhase, TxRef},
    notify::{emit_logged, EventKind, LifecycleEvent, NotificationEmitter},
    store::{RecordStore, StoreError},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, span, warn, Instrument, Level};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Age after which an intent with no ledger trace is abandoned.
    pub intent_ttl: Duration,
    /// Jobs checked in parallel within one pass.
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            intent_ttl: Duration::from_secs(600),
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Record and ledger agree. Nothing was written.
    Consistent,
    /// Frozen, out of scope, or lost a race with a live command.
    Skipped,
    /// An intent is in flight and the ledger has not caught up yet.
    AwaitingLedger,
    /// A lost commit was replayed from ledger truth.
    Healed(Job),
    /// An intent aged out without reaching the ledger and was cleared.
    IntentExpired(Job),
    /// The divergence cannot be explained; the job is now frozen.
    Fault(Job),
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Consistent => "consistent",
            Verdict::Skipped => "skipped",
            Verdict::AwaitingLedger => "awaiting_ledger",
            Verdict::Healed(_) => "healed",
            Verdict::IntentExpired(_) => "intent_expired",
            Verdict::Fault(_) => "fault",
        }
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            Verdict::Healed(job) | Verdict::IntentExpired(job) | Verdict::Fault(job) => Some(job),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub consistent: usize,
    pub skipped: usize,
    pub awaiting: usize,
    pub healed: usize,
    pub expired: usize,
    pub faults: usize,
    pub errors: usize,
}

impl ReconcileReport {
    fn record(&mut self, verdict: &Result<Verdict>) {
        self.scanned += 1;
        match verdict {
            Ok(Verdict::Consistent) => self.consistent += 1,
            Ok(Verdict::Skipped) => self.skipped += 1,
            Ok(Verdict::AwaitingLedger) => self.awaiting += 1,
            Ok(Verdict::Healed(_)) => self.healed += 1,
            Ok(Verdict::IntentExpired(_)) => self.expired += 1,
            Ok(Verdict::Fault(_)) => self.faults += 1,
            Err(_) => self.errors += 1,
        }
    }

    /// True when the pass changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.healed == 0 && self.expired == 0 && self.faults == 0 && self.errors == 0
    }
}

/// What a job needs, decided from the record and the ledger alone.
#[derive(Debug, PartialEq)]
pub(crate) enum Repair {
    Nothing(Verdict),
    Confirm(LedgerOp),
    ExpireIntent,
    Freeze(String),
}

pub(crate) fn assess(
    job: &Job,
    ledger: Option<&LedgerJobState>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Repair {
    let phase = ledger.map(|s| s.phase);
    let intent_expired = job.pending_ledger_op.as_ref().map(|intent| {
        now.signed_duration_since(intent.recorded_at)
            .to_std()
            .is_ok_and(|age| age >= ttl)
    });
    let waiting = || match intent_expired {
        Some(true) => Repair::ExpireIntent,
        Some(false) => Repair::Nothing(Verdict::AwaitingLedger),
        None => Repair::Nothing(Verdict::Consistent),
    };
    match (job.status, phase) {
        (JobStatus::AwaitingPayment, None | Some(LedgerPhase::AwaitingFund)) => waiting(),
        (JobStatus::AwaitingPayment, Some(LedgerPhase::AwaitingDelivery)) => {
            match (job.selected_bid(), ledger) {
                (Some(bid), Some(state))
                    if state.freelancer == bid.payout_address && state.amount == bid.amount =>
                {
                    Repair::Confirm(LedgerOp::Fund)
                }
                (bid, state) => Repair::Freeze(format!(
                    "ledger escrow ({:?}, {:?}) does not match the selected bid ({:?}, {:?})",
                    state.map(|s| s.freelancer),
                    state.map(|s| s.amount),
                    bid.map(|b| b.payout_address),
                    bid.map(|b| b.amount),
                )),
            }
        }
        (JobStatus::AwaitingPayment, Some(phase)) => Repair::Freeze(format!(
            "ledger reports {} before the record saw funding",
            phase
        )),
        (JobStatus::InEscrow | JobStatus::Submitted, None) => {
            Repair::Freeze("record shows escrow funded but the ledger has no such job".into())
        }
        (JobStatus::InEscrow | JobStatus::Submitted, Some(LedgerPhase::AwaitingFund)) => {
            Repair::Freeze("record shows escrow funded but the ledger reports AWAITING_FUND".into())
        }
        (JobStatus::InEscrow | JobStatus::Submitted, Some(LedgerPhase::AwaitingDelivery)) => waiting(),
        (JobStatus::InEscrow | JobStatus::Submitted, Some(LedgerPhase::Complete)) => {
            Repair::Confirm(LedgerOp::Release)
        }
        (JobStatus::InEscrow | JobStatus::Submitted, Some(LedgerPhase::Refunded)) => Repair::Freeze(
            "ledger refunded the escrow while the job is still open".into(),
        ),
        _ => Repair::Nothing(Verdict::Skipped),
    }
}

pub struct Reconciler<S, L, N> {
    store: Arc<S>,
    ledger: Arc<L>,
    notifier: Arc<N>,
    config: ReconcilerConfig,
}

impl<S, L, N> Reconciler<S, L, N>
where
    S: RecordStore,
    L: LedgerGateway,
    N: NotificationEmitter,
{
    pub fn new(store: Arc<S>, ledger: Arc<L>, notifier: Arc<N>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            ledger,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Compare one job with the ledger and repair it if needed. Running this
    /// on a consistent job writes nothing.
    pub async fn reconcile_job(&self, id: JobId) -> Result<Verdict> {
        let span = span!(Level::DEBUG, "reconcile", job_id = %id);
        self.reconcile_job_inner(id).instrument(span).await
    }

    async fn reconcile_job_inner(&self, id: JobId) -> Result<Verdict> {
        let job = self
            .store
            .get(id)
            .await
            .map_err(|e| LifecycleError::from_store(id, e))?;
        if job.is_frozen() || !job.status.is_ledger_pending() {
            return Ok(Verdict::Skipped);
        }
        let state = self
            .ledger
            .query_state(id)
            .await
            .map_err(|e| LifecycleError::from_ledger(id, e))?;

        let repair = assess(&job, state.as_ref(), Utc::now(), self.config.intent_ttl);
        debug!(status = %job.status, ledger = ?state.as_ref().map(|s| s.phase), ?repair, "assessed");
        match repair {
            Repair::Nothing(verdict) => Ok(verdict),
            Repair::Confirm(op) => {
                let tx_ref = self.recover_tx(&job, op).await;
                let next = machine::confirm(&job, op, tx_ref)?;
                let Some(healed) = self.commit(&job, next).await? else {
                    return Ok(Verdict::Skipped);
                };
                info!(%op, %tx_ref, "replayed lost ledger commit");
                let kind = match op {
                    LedgerOp::Fund => EventKind::EscrowFunded,
                    LedgerOp::Release => EventKind::PaymentReleased,
                };
                let payload = settled_payload(&healed, Some(tx_ref), true);
                self.emit(LifecycleEvent::new(kind, id, payload)).await;
                Ok(Verdict::Healed(healed))
            }
            Repair::ExpireIntent => {
                let Some(cleared) = self.commit(&job, machine::clear_intent(&job)).await? else {
                    return Ok(Verdict::Skipped);
                };
                warn!(
                    intent = ?job.pending_ledger_op,
                    "ledger intent expired without reaching the ledger, job is retryable"
                );
                Ok(Verdict::IntentExpired(cleared))
            }
            Repair::Freeze(reason) => {
                match freeze_job(&*self.store, &*self.notifier, &job, &reason, state.as_ref()).await? {
                    Some(frozen) => Ok(Verdict::Fault(frozen)),
                    None => Ok(Verdict::Skipped),
                }
            }
        }
    }

    /// One pass over every job that may be waiting on the ledger.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let jobs = self
            .store
            .list(&JobFilter::with_statuses(&JobStatus::LEDGER_PENDING))
            .await
            .map_err(|e| LifecycleError::from_store(JobId(0), e))?;
        let mut report = ReconcileReport::default();
        let ids: Vec<JobId> = jobs
            .iter()
            .filter(|job| {
                let frozen = job.is_frozen();
                if frozen {
                    report.skipped += 1;
                    report.scanned += 1;
                }
                !frozen
            })
            .map(|job| job.id)
            .collect();

        let verdicts: Vec<(JobId, Result<Verdict>)> = futures::stream::iter(ids)
            .map(|id| async move { (id, self.reconcile_job(id).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for (id, verdict) in &verdicts {
            if let Err(e) = verdict {
                warn!(job_id = %id, "reconciliation failed: {}", e);
            }
            report.record(verdict);
        }
        Ok(report)
    }

    async fn recover_tx(&self, job: &Job, op: LedgerOp) -> TxRef {
        if let Some(tx_ref) = job
            .pending_ledger_op
            .as_ref()
            .filter(|intent| intent.op == op)
            .and_then(|intent| intent.tx_ref)
        {
            return tx_ref;
        }
        match self.ledger.find_transaction(job.id, op).await {
            Ok(Some(tx_ref)) => tx_ref,
            Ok(None) => TxRef::Recovered,
            Err(e) => {
                warn!(%op, "transaction lookup failed, recording sentinel: {}", e);
                TxRef::Recovered
            }
        }
    }

    async fn commit(&self, read: &Job, next: Job) -> Result<Option<Job>> {
        commit_unless_moved(&*self.store, read, next).await
    }

    async fn emit(&self, event: LifecycleEvent) {
        emit_logged(&*self.notifier, event).await;
    }
}

/// Version-guarded write. `None` when a concurrent command moved the job
/// first.
async fn commit_unless_moved<S: RecordStore>(store: &S, read: &Job, next: Job) -> Result<Option<Job>> {
    match store.compare_and_set(read.id, read.version, next).await {
        Ok(job) => Ok(Some(job)),
        Err(StoreError::Conflict { .. }) => {
            debug!(job_id = %read.id, "job moved before the write, leaving it to the next pass");
            Ok(None)
        }
        Err(e) => Err(LifecycleError::from_store(read.id, e)),
    }
}

/// Freeze `job` against further transitions and raise the operator alert.
pub(crate) async fn freeze_job<S, N>(
    store: &S,
    notifier: &N,
    job: &Job,
    reason: &str,
    ledger: Option<&LedgerJobState>,
) -> Result<Option<Job>>
where
    S: RecordStore,
    N: NotificationEmitter,
{
    let Some(frozen) = commit_unless_moved(store, job, machine::freeze(job, reason.to_owned())).await?
    else {
        return Ok(None);
    };
    error!(job_id = %job.id, status = %job.status, ?ledger, "integrity fault, job frozen: {}", reason);
    let payload = json!({ "reason": reason, "status": job.status, "ledger": ledger });
    emit_logged(notifier, LifecycleEvent::new(EventKind::IntegrityFault, job.id, payload)).await;
    Ok(Some(frozen))
}

pub struct ReconcilerHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ReconcilerHandle {
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(Duration::from_secs(10), &mut self.handle).await {
            Ok(Ok(())) => info!("reconciler stopped"),
            Ok(Err(e)) => error!("reconciler task failed: {}", e),
            Err(_) => {
                warn!("reconciler did not stop in time, aborting");
                self.handle.abort();
            }
        }
    }
}

async fn next_nudge(nudges: &mut Option<mpsc::UnboundedReceiver<JobId>>) -> Option<JobId> {
    match nudges {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<S, L, N> Reconciler<S, L, N>
where
    S: RecordStore + 'static,
    L: LedgerGateway + 'static,
    N: NotificationEmitter + 'static,
{
    /// Run passes every `interval` until stopped. Ids received on `nudges`
    /// are reconciled immediately.
    pub fn spawn(
        self: Arc<Self>,
        mut nudges: Option<mpsc::UnboundedReceiver<JobId>>,
    ) -> ReconcilerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(self.config.interval));
            info!(interval = ?self.config.interval, "reconciler started");
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    Some(_) = ticks.next() => match self.reconcile_once().await {
                        Ok(report) if report.is_quiet() => debug!(?report, "reconciliation pass"),
                        Ok(report) => info!(?report, "reconciliation pass"),
                        Err(e) => error!("reconciliation pass failed: {}", e),
                    },
                    Some(id) = next_nudge(&mut nudges) => match self.reconcile_job(id).await {
                        Ok(verdict) => debug!(job_id = %id, verdict = verdict.label(), "nudged"),
                        Err(e) => warn!(job_id = %id, "nudged reconciliation failed: {}", e),
                    },
                }
            }
        });
        ReconcilerHandle { handle, shutdown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::{Coordinator, CoordinatorConfig, Outcome},
        model::UserId,
        store::MemoryStore,
        test_utils::{
            fixture_bid, fixture_job, FakeLedger, FlakyStore, LedgerScript, RecordingEmitter,
        },
    };
    use alloy::primitives::{Address, U256};

    type Store = FlakyStore<MemoryStore>;

    struct Harness {
        coordinator: Coordinator<Store, FakeLedger, RecordingEmitter>,
        reconciler: Reconciler<Store, FakeLedger, RecordingEmitter>,
        ledger: Arc<FakeLedger>,
        emitter: Arc<RecordingEmitter>,
    }

    fn harness(intent_ttl: Duration) -> Harness {
        let ledger = Arc::new(FakeLedger::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let coordinator = Coordinator::new(
            Arc::new(FlakyStore::new(MemoryStore::new())),
            ledger.clone(),
            emitter.clone(),
            CoordinatorConfig {
                ledger_timeout: Duration::from_millis(100),
            },
        );
        let reconciler = coordinator.reconciler(ReconcilerConfig {
            interval: Duration::from_millis(20),
            intent_ttl,
            concurrency: 4,
        });
        Harness {
            coordinator,
            reconciler,
            ledger,
            emitter,
        }
    }

    fn client() -> UserId {
        "client".into()
    }

    fn f1() -> UserId {
        "f1".into()
    }

    impl Harness {
        async fn awaiting_payment(&self) -> Job {
            let c = &self.coordinator;
            let job = c.create_job(fixture_job("client")).await.unwrap();
            let job = c.submit_bid(&f1(), job.id, fixture_bid(1)).await.unwrap();
            c.select_bid(&client(), job.id, job.bids[0].id).await.unwrap()
        }

        async fn in_escrow(&self) -> Job {
            let job = self.awaiting_payment().await;
            self.coordinator
                .fund_escrow(&client(), job.id)
                .await
                .unwrap()
                .into_job()
        }
    }

    /// Drop the record commit that follows a successful ledger call.
    fn crash_after_ledger(store: &Store, op: LedgerOp) {
        store.fail_next_cas(move |job| match op {
            LedgerOp::Fund => job.escrow_funded,
            LedgerOp::Release => job.status == JobStatus::Complete,
        });
    }

    #[tokio::test]
    async fn crash_after_funding_heals_to_the_uninterrupted_state() {
        let uninterrupted = {
            let h = harness(Duration::from_secs(600));
            h.in_escrow().await
        };

        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        crash_after_ledger(h.coordinator.store(), LedgerOp::Fund);
        let err = h.coordinator.fund_escrow(&client(), job.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Store(_)));

        let stuck = h.coordinator.get_job(job.id).await.unwrap();
        assert_eq!(stuck.status, JobStatus::AwaitingPayment);
        assert!(stuck.pending_ledger_op.is_some());

        let Verdict::Healed(healed) = h.reconciler.reconcile_job(job.id).await.unwrap() else {
            panic!("expected the lost commit to be replayed");
        };
        assert_eq!(healed.status, uninterrupted.status);
        assert_eq!(healed.escrow_funded, uninterrupted.escrow_funded);
        assert_eq!(healed.escrow_tx_ref, uninterrupted.escrow_tx_ref);
        assert_eq!(healed.pending_ledger_op, uninterrupted.pending_ledger_op);
        assert_eq!(healed.version, uninterrupted.version);
        assert_eq!(healed.selected_bid_id, uninterrupted.selected_bid_id);
        assert_eq!(h.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn crash_after_release_heals_to_complete() {
        let h = harness(Duration::from_secs(600));
        let job = h.in_escrow().await;
        h.coordinator
            .submit_work(&f1(), job.id, "done".into())
            .await
            .unwrap();
        crash_after_ledger(h.coordinator.store(), LedgerOp::Release);
        assert!(h.coordinator.approve_work(&client(), job.id).await.is_err());

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.healed, 1);
        let job = h.coordinator.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.completion_tx_ref, h.ledger.tx_for(job.id, LedgerOp::Release));
        job.check_invariants().unwrap();
        assert_eq!(h.emitter.kinds().last(), Some(&EventKind::PaymentReleased));
    }

    #[tokio::test]
    async fn missing_transaction_history_records_the_sentinel() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        crash_after_ledger(h.coordinator.store(), LedgerOp::Fund);
        let _ = h.coordinator.fund_escrow(&client(), job.id).await;
        h.ledger.forget_transactions();

        let verdict = h.reconciler.reconcile_job(job.id).await.unwrap();
        assert_eq!(verdict.job().unwrap().escrow_tx_ref, Some(TxRef::Recovered));
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        crash_after_ledger(h.coordinator.store(), LedgerOp::Fund);
        let _ = h.coordinator.fund_escrow(&client(), job.id).await;

        let first = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.healed, 1);
        let after_first = h.coordinator.get_job(job.id).await.unwrap();
        let events = h.emitter.events().len();

        let second = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(second.consistent, 1);
        assert!(second.is_quiet());
        assert_eq!(h.coordinator.get_job(job.id).await.unwrap(), after_first);
        assert_eq!(h.emitter.events().len(), events);
    }

    #[tokio::test]
    async fn timed_out_command_is_completed_by_reconciliation() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        h.ledger.set_confirm_delay(Duration::from_secs(5));

        let outcome = h.coordinator.fund_escrow(&client(), job.id).await.unwrap();
        assert!(matches!(outcome, Outcome::Pending(_)));

        let verdict = h.reconciler.reconcile_job(job.id).await.unwrap();
        let healed = verdict.job().unwrap();
        assert_eq!(healed.status, JobStatus::InEscrow);
        assert_eq!(healed.escrow_tx_ref, h.ledger.tx_for(job.id, LedgerOp::Fund));
        assert_eq!(h.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn uncertain_with_known_hash_heals_with_that_hash() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        h.ledger.script([LedgerScript::LandUncertain]);
        let pending = h.coordinator.fund_escrow(&client(), job.id).await.unwrap();
        let tx = pending.job().pending_ledger_op.as_ref().unwrap().tx_ref;
        assert!(tx.is_some());
        h.ledger.forget_transactions();

        let verdict = h.reconciler.reconcile_job(job.id).await.unwrap();
        assert_eq!(verdict.job().unwrap().escrow_tx_ref, tx);
    }

    #[tokio::test]
    async fn live_intents_wait_and_stale_ones_expire() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        h.ledger.script([LedgerScript::DropUncertain]);
        assert!(h.coordinator.fund_escrow(&client(), job.id).await.unwrap().is_pending());
        assert_eq!(
            h.reconciler.reconcile_job(job.id).await.unwrap(),
            Verdict::AwaitingLedger
        );

        let h = harness(Duration::ZERO);
        let job = h.awaiting_payment().await;
        h.ledger.script([LedgerScript::DropUncertain]);
        assert!(h.coordinator.fund_escrow(&client(), job.id).await.unwrap().is_pending());
        let Verdict::IntentExpired(job) = h.reconciler.reconcile_job(job.id).await.unwrap() else {
            panic!("stale intent should expire");
        };
        assert!(job.pending_ledger_op.is_none());
        assert_eq!(job.status, JobStatus::AwaitingPayment);

        // The job is retryable again.
        let outcome = h.coordinator.fund_escrow(&client(), job.id).await.unwrap();
        assert_eq!(outcome.job().status, JobStatus::InEscrow);
    }

    #[tokio::test]
    async fn ledger_behind_a_funded_record_freezes_the_job() {
        let h = harness(Duration::from_secs(600));
        let job = h.in_escrow().await;
        h.ledger.force_state(job.id, None);

        let Verdict::Fault(frozen) = h.reconciler.reconcile_job(job.id).await.unwrap() else {
            panic!("expected an integrity fault");
        };
        // Status is never downgraded.
        assert_eq!(frozen.status, JobStatus::InEscrow);
        assert!(frozen.escrow_funded);
        assert!(frozen.is_frozen());
        assert_eq!(h.emitter.kinds().last(), Some(&EventKind::IntegrityFault));

        let err = h
            .coordinator
            .submit_work(&f1(), job.id, "done".into())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IntegrityFault { .. }));

        // Frozen jobs are left alone by later passes.
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.faults, 0);

        let job = h.coordinator.clear_integrity_fault(job.id).await.unwrap();
        assert!(!job.is_frozen());
        assert_eq!(job.status, JobStatus::InEscrow);
    }

    #[tokio::test]
    async fn escrow_for_the_wrong_payee_is_a_fault() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        h.ledger
            .fund(job.id, Address::repeat_byte(0xee), U256::from(1))
            .await
            .unwrap();

        let verdict = h.reconciler.reconcile_job(job.id).await.unwrap();
        assert!(matches!(verdict, Verdict::Fault(_)));
        assert_eq!(
            verdict.job().unwrap().status,
            JobStatus::AwaitingPayment,
            "the record must not adopt the mismatched escrow"
        );
    }

    #[test]
    fn refunds_and_early_completion_are_faults() {
        let ttl = Duration::from_secs(60);
        let mut job = crate::test_utils::fixture_open_job_with_bids(&["f1"]);
        job.selected_bid_id = Some(job.bids[0].id);
        job.status = JobStatus::AwaitingPayment;
        let state = |phase| LedgerJobState {
            client: Address::repeat_byte(1),
            freelancer: job.bids[0].payout_address,
            amount: job.bids[0].amount,
            phase,
            created_at: 0,
        };
        assert!(matches!(
            assess(&job, Some(&state(LedgerPhase::Complete)), Utc::now(), ttl),
            Repair::Freeze(_)
        ));
        assert_eq!(
            assess(&job, Some(&state(LedgerPhase::AwaitingDelivery)), Utc::now(), ttl),
            Repair::Confirm(LedgerOp::Fund)
        );
        assert_eq!(
            assess(&job, None, Utc::now(), ttl),
            Repair::Nothing(Verdict::Consistent)
        );

        let funded = Job {
            status: JobStatus::Submitted,
            escrow_funded: true,
            escrow_tx_ref: Some(TxRef::Recovered),
            ..job.clone()
        };
        assert!(matches!(
            assess(&funded, Some(&state(LedgerPhase::Refunded)), Utc::now(), ttl),
            Repair::Freeze(_)
        ));
        assert_eq!(
            assess(&funded, Some(&state(LedgerPhase::AwaitingDelivery)), Utc::now(), ttl),
            Repair::Nothing(Verdict::Consistent)
        );
    }

    #[tokio::test]
    async fn spawned_loop_heals_nudged_jobs_and_stops() {
        let h = harness(Duration::from_secs(600));
        let job = h.awaiting_payment().await;
        h.ledger.set_confirm_delay(Duration::from_secs(5));
        assert!(h.coordinator.fund_escrow(&client(), job.id).await.unwrap().is_pending());

        let (nudge, nudges) = mpsc::unbounded_channel();
        let handle = Arc::new(h.reconciler).spawn(Some(nudges));
        nudge.send(job.id).unwrap();

        let healed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job = h.coordinator.get_job(job.id).await.unwrap();
                if job.status == JobStatus::InEscrow {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler should heal the job");
        assert!(healed.pending_ledger_op.is_none());
        handle.stop().await;
    }
}
