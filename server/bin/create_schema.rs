use anyhow::Result;
use escrow_server::{app_config, db};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    app_config::init_console_subscriber();
    let db = db::DB::new_from_environment().await?;

    match db::create_schema(&db.pool).await {
        Ok(_) => {
            info!("Database schema setup completed successfully.");
            Ok(())
        }
        Err(e) => {
            error!("Error setting up database schema: {}", e);
            Err(e.into())
        }
    }
}
