use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inventory_backend::{
    config::Config,
    db::connection::create_pool,
    repositories::PgSessionStore,
    services::{run_sweep, SweepSettings},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inventory_backend=info,presence_cleanup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let pool = create_pool(&config.database_url, 1).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let state = AppState::new(Arc::new(PgSessionStore::new(pool.clone())), config.clone());
    let outcome = run_sweep(&state.presence, &SweepSettings::from_config(&config)).await;

    if outcome.retired > 0 {
        tracing::info!("Retired {} stale presence sessions", outcome.retired);
    }
    if outcome.purged > 0 {
        tracing::info!("Deleted {} retired presence sessions", outcome.purged);
    }

    sqlx::query("VACUUM (ANALYZE) presence_sessions")
        .execute(&pool)
        .await?;

    tracing::info!(
        active_count = outcome.active_count,
        "Presence cleanup finished"
    );
    Ok(())
}
