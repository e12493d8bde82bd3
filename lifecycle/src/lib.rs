pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod retry;
pub mod store;

#[cfg(any(test, feature = "test"))]
pub mod test_utils;

pub use coordinator::{Coordinator, CoordinatorConfig, Outcome};
pub use error::{Action, LifecycleError, Missing};
pub use ledger::{LedgerError, LedgerGateway};
pub use model::*;
pub use notify::{
    spawn_forwarder, ChannelEmitter, EventKind, LifecycleEvent, NotificationEmitter, TracingEmitter,
};
pub use reconcile::{ReconcileReport, Reconciler, ReconcilerConfig, ReconcilerHandle, Verdict};
pub use retry::{with_backoff, BackoffPolicy};
pub use store::{MemoryStore, RecordStore, StoreError};
