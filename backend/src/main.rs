use std::sync::Arc;

use ledgerflow_backend::{
    app_router, config, database, init_tracing,
    jobs::JobScheduler,
    postgres_engine, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = config::Config::from_env()?;

    // A malformed catalog stops the process before anything is served
    let catalog = config.workflow.load_catalog()?;
    tracing::info!("Workflow catalog ready with {} definitions", catalog.len());

    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;

    let engine = postgres_engine(db_pool.clone(), catalog, &config.workflow);

    let mut scheduler = JobScheduler::new(engine.clone(), config.workflow.job_config()).await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        engine,
        db_pool: Some(db_pool),
    });
    let app = app_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
