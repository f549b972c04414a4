use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::Config;

/// Open the pool described by `cfg.db`.
pub async fn connect(cfg: &Config) -> anyhow::Result<PgPool> {
    let settings = cfg.db.clone();
    let options: PgConnectOptions = cfg.database_url.parse()?;
    let options = options.application_name(&settings.application_name);

    let disable_jit = settings.disable_jit;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // lease and status queries are short; planning overhead dominates
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    tracing::debug!(
        max_connections = settings.max_connections,
        application_name = %settings.application_name,
        "database pool ready"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
