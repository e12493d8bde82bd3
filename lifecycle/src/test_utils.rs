use crate::{
    error::Action,
    ledger::{LedgerError, LedgerGateway},
    model::{
        Bid, BidId, Job, JobFilter, JobId, JobStatus, LedgerJobState, LedgerOp, LedgerPhase,
        NewBid, NewJob, TxRef, UserId,
    },
    notify::{EventKind, LifecycleEvent, NotificationEmitter},
    store::{RecordStore, StoreError},
};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

pub const ONE_ETHER: u128 = 1_000_000_000_000_000_000;

pub fn ether_tenths(tenths: u64) -> U256 {
    U256::from(ONE_ETHER / 10) * U256::from(tenths)
}

pub fn fixture_job(client: &str) -> NewJob {
    NewJob {
        client_id: client.into(),
        title: "Port the indexer to Rust".into(),
        description: "Rewrite the event indexer".into(),
        budget: ether_tenths(20),
        deadline: Utc::now() + ChronoDuration::days(30),
        category: "development".into(),
        skills: BTreeSet::from(["rust".to_string(), "solidity".to_string()]),
    }
}

pub fn fixture_bid(seed: u8) -> NewBid {
    NewBid {
        payout_address: Address::repeat_byte(seed.max(1)),
        amount: ether_tenths(15),
        delivery_days: 5,
        proposal: format!("proposal {}", seed),
    }
}

/// An OPEN job owned by `client` with one bid per freelancer name.
pub fn fixture_open_job_with_bids(freelancers: &[&str]) -> Job {
    let new = fixture_job("client");
    let id = JobId(1);
    let bids = freelancers
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let b = fixture_bid(i as u8 + 1);
            Bid {
                id: BidId(i as u64 + 1),
                job_id: id,
                freelancer_id: (*name).into(),
                payout_address: b.payout_address,
                amount: b.amount,
                delivery_days: b.delivery_days,
                proposal: b.proposal,
                created_at: Utc::now(),
            }
        })
        .collect();
    Job {
        id,
        client_id: new.client_id,
        title: new.title,
        description: new.description,
        budget: new.budget,
        deadline: new.deadline,
        category: new.category,
        skills: new.skills,
        status: JobStatus::Open,
        bids,
        selected_bid_id: None,
        escrow_funded: false,
        escrow_tx_ref: None,
        completion_tx_ref: None,
        work_submission: None,
        revision_note: None,
        dispute_reason: None,
        pending_ledger_op: None,
        integrity_fault: None,
        created_at: Utc::now(),
        version: 1,
    }
}

/// One command attempt in a generated scenario.
#[derive(Debug, Clone)]
pub struct Step {
    pub actor: usize,
    pub action: Action,
    pub pick: usize,
}

impl Arbitrary for Step {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (any::<usize>(), prop::sample::select(Action::ALL.to_vec()), any::<usize>())
            .prop_map(|(actor, action, pick)| Step {
                actor,
                action,
                pick,
            })
            .boxed()
    }
}

/// Scripted misbehaviour for the next ledger submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerScript {
    /// Fail before reaching the ledger.
    Unavailable,
    /// Land the transaction but report the outcome as unknown.
    LandUncertain,
    /// Drop the transaction and report the outcome as unknown.
    DropUncertain,
    Reject,
}

#[derive(Default)]
struct FakeLedgerState {
    jobs: HashMap<JobId, LedgerJobState>,
    txs: HashMap<(JobId, LedgerOp), TxRef>,
    script: VecDeque<LedgerScript>,
    submissions: Vec<(JobId, LedgerOp)>,
    query_failures: u32,
    next_tx: u64,
    confirm_delay: Option<Duration>,
}

impl FakeLedgerState {
    fn next_tx(&mut self) -> TxRef {
        self.next_tx += 1;
        TxRef::Hash(B256::left_padding_from(&self.next_tx.to_be_bytes()))
    }
}

/// In-memory escrow ledger with scripted failures.
pub struct FakeLedger {
    client: Address,
    state: Mutex<FakeLedgerState>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            client: Address::repeat_byte(0xc1),
            state: Mutex::new(FakeLedgerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeLedgerState> {
        self.state.lock().expect("fake ledger lock poisoned")
    }

    pub fn script(&self, steps: impl IntoIterator<Item = LedgerScript>) {
        self.lock().script.extend(steps);
    }

    pub fn fail_queries(&self, n: u32) {
        self.lock().query_failures = n;
    }

    /// Land transactions immediately but wait this long before confirming.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.lock().confirm_delay = Some(delay);
    }

    pub fn submissions(&self) -> Vec<(JobId, LedgerOp)> {
        self.lock().submissions.clone()
    }

    pub fn state_of(&self, job: JobId) -> Option<LedgerJobState> {
        self.lock().jobs.get(&job).cloned()
    }

    pub fn tx_for(&self, job: JobId, op: LedgerOp) -> Option<TxRef> {
        self.lock().txs.get(&(job, op)).copied()
    }

    /// Overwrite ledger truth, bypassing the contract rules.
    pub fn force_state(&self, job: JobId, state: Option<LedgerJobState>) {
        let mut s = self.lock();
        match state {
            Some(state) => s.jobs.insert(job, state),
            None => s.jobs.remove(&job),
        };
    }

    /// Forget the transaction index, as if event logs were pruned.
    pub fn forget_transactions(&self) {
        self.lock().txs.clear();
    }

    fn apply(&self, s: &mut FakeLedgerState, job: JobId, op: LedgerOp, effect: Effect) -> Result<TxRef, LedgerError> {
        let phase = s.jobs.get(&job).map(|state| state.phase);
        match (effect, phase) {
            (Effect::Fund { .. }, Some(_)) => {
                return Err(LedgerError::Rejected(format!("job {} already exists", job)))
            }
            (Effect::Fund { payee, amount }, None) => {
                s.jobs.insert(
                    job,
                    LedgerJobState {
                        client: self.client,
                        freelancer: payee,
                        amount,
                        phase: LedgerPhase::AwaitingDelivery,
                        created_at: Utc::now().timestamp() as u64,
                    },
                );
            }
            (Effect::Release, Some(LedgerPhase::AwaitingDelivery)) => {
                if let Some(state) = s.jobs.get_mut(&job) {
                    state.phase = LedgerPhase::Complete;
                }
            }
            (Effect::Release, _) => {
                return Err(LedgerError::Rejected(format!("job {} is not releasable", job)))
            }
        }
        let tx = s.next_tx();
        s.txs.insert((job, op), tx);
        Ok(tx)
    }

    async fn submit(&self, job: JobId, op: LedgerOp, effect: Effect) -> Result<TxRef, LedgerError> {
        let (result, delay) = {
            let mut s = self.lock();
            let script = s.script.pop_front();
            if script != Some(LedgerScript::Unavailable) {
                s.submissions.push((job, op));
            }
            let result = match script {
                None => self.apply(&mut s, job, op, effect),
                Some(LedgerScript::Unavailable) => {
                    Err(LedgerError::Unavailable("connection refused".into()))
                }
                Some(LedgerScript::Reject) => Err(LedgerError::Rejected("execution reverted".into())),
                Some(LedgerScript::LandUncertain) => match self.apply(&mut s, job, op, effect) {
                    Ok(tx) => Err(LedgerError::Uncertain {
                        tx_ref: Some(tx),
                        reason: "receipt not available".into(),
                    }),
                    Err(e) => Err(e),
                },
                Some(LedgerScript::DropUncertain) => Err(LedgerError::Uncertain {
                    tx_ref: None,
                    reason: "transport closed after broadcast".into(),
                }),
            };
            (result, s.confirm_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

enum Effect {
    Fund { payee: Address, amount: U256 },
    Release,
}

impl LedgerGateway for FakeLedger {
    async fn fund(&self, job: JobId, payee: Address, amount: U256) -> Result<TxRef, LedgerError> {
        self.submit(job, LedgerOp::Fund, Effect::Fund { payee, amount }).await
    }

    async fn release(&self, job: JobId) -> Result<TxRef, LedgerError> {
        self.submit(job, LedgerOp::Release, Effect::Release).await
    }

    async fn query_state(&self, job: JobId) -> Result<Option<LedgerJobState>, LedgerError> {
        let mut s = self.lock();
        if s.query_failures > 0 {
            s.query_failures -= 1;
            return Err(LedgerError::Unavailable("node unreachable".into()));
        }
        Ok(s.jobs.get(&job).cloned())
    }

    async fn find_transaction(&self, job: JobId, op: LedgerOp) -> Result<Option<TxRef>, LedgerError> {
        Ok(self.lock().txs.get(&(job, op)).copied())
    }
}

#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<LifecycleEvent>>,
    failing: Mutex<bool>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("emitter lock poisoned") = failing;
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().expect("emitter lock poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl NotificationEmitter for RecordingEmitter {
    async fn emit(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        if *self.failing.lock().expect("emitter lock poisoned") {
            anyhow::bail!("mail relay down");
        }
        self.events.lock().expect("emitter lock poisoned").push(event);
        Ok(())
    }
}

type CasPredicate = Box<dyn Fn(&Job) -> bool + Send + Sync>;

/// Wraps a store and fails chosen writes, simulating a crash between the
/// ledger call and the record commit.
pub struct FlakyStore<S> {
    inner: S,
    fail_when: Mutex<Option<CasPredicate>>,
}

impl<S: RecordStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_when: Mutex::new(None),
        }
    }

    /// Fail the next `compare_and_set` whose new value matches `pred`.
    pub fn fail_next_cas(&self, pred: impl Fn(&Job) -> bool + Send + Sync + 'static) {
        *self.fail_when.lock().expect("flaky store lock poisoned") = Some(Box::new(pred));
    }

    fn should_fail(&self, job: &Job) -> bool {
        let mut slot = self.fail_when.lock().expect("flaky store lock poisoned");
        if slot.as_ref().is_some_and(|pred| pred(job)) {
            *slot = None;
            return true;
        }
        false
    }
}

impl<S: RecordStore> RecordStore for FlakyStore<S> {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        self.inner.insert(job, now).await
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner.get(id).await
    }

    async fn compare_and_set(&self, id: JobId, expected_version: u64, job: Job) -> Result<Job, StoreError> {
        if self.should_fail(&job) {
            return Err(StoreError::Backend("connection reset by peer".into()));
        }
        self.inner.compare_and_set(id, expected_version, job).await
    }

    async fn append_bid(&self, id: JobId, freelancer: UserId, bid: NewBid, now: DateTime<Utc>) -> Result<Job, StoreError> {
        self.inner.append_bid(id, freelancer, bid, now).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.inner.list(filter).await
    }
}
