use escrow_server::{app_config, db};
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app_config::init_console_subscriber();
    let conn = db::DB::new_from_environment().await?.pool;
    let db_name = env::var("DB_CREATE_NAME")?;
    info!("Creating database '{}'", db_name);

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&conn)
            .await?;

    if exists {
        info!("Database '{}' already exists.", db_name);
        return Ok(());
    }

    sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name.replace('"', "\"\"")))
        .execute(&conn)
        .await?;

    info!("Database '{}' created successfully.", db_name);

    Ok(())
}
