use crate::model::JobId;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobCreated,
    BidReceived,
    BidSelected,
    EscrowFunded,
    WorkSubmitted,
    RevisionRequested,
    PaymentReleased,
    DisputeRaised,
    LedgerPending,
    IntegrityFault,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub job_id: JobId,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, job_id: JobId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            job_id,
            payload,
            at: Utc::now(),
        }
    }
}

/// Downstream sink for lifecycle events. The coordinator logs failures and
/// carries on; an emitter must never be relied on for correctness.
///
/// Commands await `emit` after their write has committed, so it has to return
/// promptly. Sinks that do I/O go behind [`spawn_forwarder`].
pub trait NotificationEmitter: Send + Sync {
    fn emit(&self, event: LifecycleEvent) -> impl Future<Output = Result<()>> + Send;
}

/// Emit `event`, logging instead of returning any failure.
pub(crate) async fn emit_logged<N: NotificationEmitter>(notifier: &N, event: LifecycleEvent) {
    let (job_id, kind) = (event.job_id, event.kind);
    if let Err(e) = notifier.emit(event).await {
        warn!(%job_id, %kind, "failed to emit lifecycle event: {:#}", e);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl NotificationEmitter for TracingEmitter {
    async fn emit(&self, event: LifecycleEvent) -> Result<()> {
        info!(
            job_id = %event.job_id,
            kind = %event.kind,
            payload = %event.payload,
            "lifecycle event"
        );
        Ok(())
    }
}

/// Forwards events into an unbounded channel.
#[derive(Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationEmitter for ChannelEmitter {
    async fn emit(&self, event: LifecycleEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("event channel closed: {}", e))
    }
}

/// Deliver events to `sink` from a background task. The returned emitter only
/// enqueues, so commands never wait on the sink. Events reach the sink in the
/// order they were emitted; the task ends once every emitter clone is dropped.
pub fn spawn_forwarder<N>(sink: N) -> (ChannelEmitter, JoinHandle<()>)
where
    N: NotificationEmitter + 'static,
{
    let (emitter, mut rx) = ChannelEmitter::new();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            emit_logged(&sink, event).await;
        }
        debug!("event channel closed, forwarder exiting");
    });
    (emitter, handle)
}
