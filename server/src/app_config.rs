use crate::db::DBConfig;
use alloy::primitives::Address;
use clap::Parser;
use escrow_ledger::EscrowGatewayConfig;
use lifecycle::{BackoffPolicy, CoordinatorConfig, ReconcilerConfig};
use serde::Serialize;
use std::{net::SocketAddr, time::Duration};
use time::macros::format_description;
use tracing_subscriber::{
    fmt::{format::FmtSpan, time::UtcTime},
    EnvFilter,
};
use url::Url;

#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Database host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD")]
    #[serde(skip_serializing)]
    pub db_password: String,

    /// Database name
    #[arg(long, env = "DB_NAME", default_value = "escrow")]
    pub db_name: String,

    /// Node host
    #[arg(long, env = "NODE_HOST", default_value = "localhost")]
    pub node_host: String,

    /// Node port
    #[arg(long, env = "NODE_PORT", default_value = "8545")]
    pub node_port: String,

    /// Chain ID the node is expected to serve
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: u64,

    /// Escrow contract address
    #[arg(long, env = "ESCROW_ADDRESS")]
    pub escrow_address: Address,

    /// Operator private key funding and releasing escrows (with or without 0x prefix)
    #[arg(long, env = "OPERATOR_KEY")]
    #[serde(skip_serializing)]
    pub operator_key: String,

    /// First block searched for escrow events
    #[arg(long, env = "ESCROW_FROM_BLOCK", default_value_t = 0)]
    pub escrow_from_block: u64,

    #[arg(long, env = "JSON_RPC_PORT", default_value = "3030")]
    pub json_rpc_port: u16,

    /// Address of the operator JSON-RPC server (clear faults, reconcile on
    /// demand). Keep it off public interfaces.
    #[arg(long, env = "ADMIN_RPC_ADDR", default_value = "127.0.0.1:3031")]
    pub admin_rpc_addr: SocketAddr,

    /// How long a command waits for the ledger before answering pending
    #[arg(long, env = "LEDGER_TIMEOUT_SECS", default_value_t = 30)]
    pub ledger_timeout_secs: u64,

    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value_t = 120)]
    pub receipt_timeout_secs: u64,

    #[arg(long, env = "CONFIRMATIONS", default_value_t = 1)]
    pub confirmations: u64,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 15)]
    pub reconcile_interval_secs: u64,

    /// Age after which an intent with no trace on the ledger is abandoned
    #[arg(long, env = "INTENT_TTL_SECS", default_value_t = 600)]
    pub intent_ttl_secs: u64,

    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 8)]
    pub reconcile_concurrency: usize,

    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    #[arg(long, env = "BACKOFF_RETRIES", default_value_t = 4)]
    pub backoff_retries: u32,
}

impl AppConfig {
    /// Get the database configuration
    pub fn db_config(&self) -> DBConfig {
        DBConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            dbname: self.db_name.clone(),
        }
    }

    /// Get the node URL
    pub fn node_url(&self) -> Result<Url, url::ParseError> {
        let node_url = format!("http://{}:{}", self.node_host, self.node_port);
        Url::parse(&node_url)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            max_retries: self.backoff_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn gateway_config(&self) -> EscrowGatewayConfig {
        EscrowGatewayConfig {
            contract: self.escrow_address,
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            confirmations: self.confirmations,
            backoff: self.backoff(),
            from_block: self.escrow_from_block,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            ledger_timeout: Duration::from_secs(self.ledger_timeout_secs),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            intent_ttl: Duration::from_secs(self.intent_ttl_secs),
            concurrency: self.reconcile_concurrency,
        }
    }
}

pub fn init_console_subscriber() {
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour repr:24]:[minute]:[second].[subsecond digits:3]Z"
    ));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(timer)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_level(true)
        .with_ansi(true)
        .with_writer(std::io::stdout)
        .init();
}
