use anyhow::Result;
use futures::{future, StreamExt};
use lifecycle::{LifecycleEvent, NotificationEmitter};
use serde::de::DeserializeOwned;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{error, span, Level};

/// Raised by the `jobs_ledger_pending` trigger with the job id as payload.
pub const LEDGER_PENDING_CHANNEL: &str = "ledger_pending";

/// Lifecycle events published for downstream consumers.
pub const EVENTS_CHANNEL: &str = "lifecycle_events";

#[derive(Clone)]
pub struct TypedChannel<T> {
    pub channel_name: String,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> TypedChannel<T> {
    pub fn new(channel_name: &str) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            _phantom: std::marker::PhantomData,
        }
    }
}

pub struct PgNotifier<T> {
    notifications: mpsc::UnboundedReceiver<T>,
}

impl<T: DeserializeOwned + Send + 'static> PgNotifier<T> {
    pub async fn new(pool: &PgPool, channel: TypedChannel<T>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(&channel.channel_name).await?;

        let listener_span = span!(
            Level::INFO,
            "pg_listener",
            channel = %channel.channel_name
        );

        tokio::spawn(async move {
            listener
                .into_stream()
                .filter_map(|message| {
                    let span = span!(parent: &listener_span, Level::DEBUG, "pg_notification");
                    match message {
                        Ok(notification) => {
                            match serde_json::from_str::<T>(notification.payload()) {
                                Ok(data) => future::ready(Some(data)),
                                Err(e) => {
                                    error!(parent: &span, error = %e, "Deserialization error");
                                    future::ready(None)
                                }
                            }
                        }
                        Err(e) => {
                            error!(parent: &span, error = %e, "Error receiving notification");
                            future::ready(None)
                        }
                    }
                })
                // Stop once nobody is subscribed.
                .take_while(|_| future::ready(!tx.is_closed()))
                .for_each(|t| {
                    let tx = tx.clone();
                    async move {
                        if let Err(e) = tx.send(t) {
                            error!(error = %e, "Failed to forward notification");
                        }
                    }
                })
                .await
        });
        Ok(Self { notifications: rx })
    }

    pub fn subscribe(self) -> mpsc::UnboundedReceiver<T> {
        self.notifications
    }
}

/// Publishes lifecycle events as JSON on `EVENTS_CHANNEL`.
#[derive(Clone)]
pub struct PgNotifyEmitter {
    pool: PgPool,
    channel: String,
}

impl PgNotifyEmitter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: EVENTS_CHANNEL.to_string(),
        }
    }
}

impl NotificationEmitter for PgNotifyEmitter {
    async fn emit(&self, event: LifecycleEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
