// Workflow Processor - Runs a single scheduler sweep and exits
//
// For deployments that drive the sweep from an external cron instead of the
// in-process job scheduler, e.g. `*/5 * * * * /usr/local/bin/workflow-processor`.

use std::process::ExitCode;

use ledgerflow_backend::{config, database, init_tracing, postgres_engine, workflows::SchedulerSweep};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        // Some rows failed; details are in the log
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("Workflow processor failed: {:#}", e);
            println!("ERROR: Workflow processor failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<bool> {
    let config = config::Config::from_env()?;
    let catalog = config.workflow.load_catalog()?;
    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;

    let engine = postgres_engine(db_pool, catalog, &config.workflow);

    tracing::info!("Starting workflow processor");
    let report = SchedulerSweep::new(engine).run_once().await?;

    println!("Workflow processor completed");
    println!("Scheduled steps processed: {}", report.resumed);
    println!("Timed-out steps processed: {}", report.escalated);
    println!("Stalled instances advanced: {}", report.recovered);
    if !report.is_clean() {
        println!("Rows with errors: {}", report.errors.len());
    }

    Ok(report.is_clean())
}
