use alloy::{providers::Provider, signers::local::PrivateKeySigner};
use anyhow::{bail, Context};
use clap::Parser;
use escrow_ledger::{create_provider, EscrowGateway};
use escrow_server::{
    app_config::{init_console_subscriber, AppConfig},
    db::{PgStore, DB},
    pg_notify::{PgNotifier, PgNotifyEmitter, TypedChannel, LEDGER_PENDING_CHANNEL},
    rpc::{serve, AdminRpc, LifecycleRpc},
};
use escrow_api::rpc::{AdminApiServer, LifecycleApiServer};
use lifecycle::{spawn_forwarder, Coordinator, JobId};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_console_subscriber();
    let cli = AppConfig::parse();
    debug!("{}", serde_json::to_string_pretty(&cli)?);

    // Define the server address
    let addr = {
        let host = "0.0.0.0";
        let addr = format!("{}:{}", host, cli.json_rpc_port);
        addr.parse::<SocketAddr>()
    }?;

    let db = DB::new(cli.db_config()).await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    let ledger = {
        let signer: PrivateKeySigner = cli
            .operator_key
            .parse()
            .context("invalid operator key")?;
        info!(operator = %signer.address(), "using operator account");
        let provider = create_provider(cli.node_url()?, signer);
        let chain_id = provider.get_chain_id().await?;
        if chain_id != cli.chain_id {
            bail!(
                "node serves chain {} but {} was configured",
                chain_id,
                cli.chain_id
            );
        }
        Arc::new(EscrowGateway::new(provider, cli.gateway_config()))
    };
    info!(escrow = %ledger.address(), chain_id = cli.chain_id, "ledger gateway ready");

    // Commands only enqueue events; delivery to Postgres happens off the
    // request path.
    let (events, forwarder) = spawn_forwarder(PgNotifyEmitter::new(db.pool.clone()));
    let notifier = Arc::new(events);
    let coordinator = Coordinator::new(store, ledger, notifier, cli.coordinator_config());

    let reconciler = Arc::new(coordinator.reconciler(cli.reconciler_config()));
    let nudges = {
        let channel = TypedChannel::<JobId>::new(LEDGER_PENDING_CHANNEL);
        PgNotifier::new(&db.pool, channel).await?.subscribe()
    };
    let reconciler_handle = reconciler.clone().spawn(Some(nudges));

    let admin = AdminRpc::new(coordinator.clone(), reconciler);
    let (_, admin_handle) = serve("admin JSON-RPC", cli.admin_rpc_addr, admin.into_rpc()).await?;
    let api = LifecycleRpc::new(coordinator);
    let (_, handle) = serve("JSON-RPC", addr, api.into_rpc()).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;

    handle.stop()?;
    admin_handle.stop()?;
    reconciler_handle.stop().await;
    forwarder.abort();
    info!("JSON-RPC server stopped");

    Ok(())
}
