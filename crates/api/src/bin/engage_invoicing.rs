//! Operator CLI for invoice generation.
//!
//! Runs against the same stores the API is configured with, so it is only
//! useful with persistent stores; an in-memory process starts empty.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use engage_api::app::services::{AppServices, build_services};
use engage_api::config::ApiConfig;
use engage_core::{AggregateId, TenantId};
use engage_infra::projections::BatchReadModel;
use engage_invoicing::BatchId;
use engage_organizations::DivisionId;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "engage-invoicing", version, about = "Invoice generation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the monthly run for a tenant and wait for the batch to finish.
    GenerateMonthly {
        #[arg(long)]
        tenant: TenantId,
        /// Billing month as `YYYY-MM`.
        #[arg(long)]
        month: String,
        /// Limit the run to one division.
        #[arg(long)]
        division: Option<AggregateId>,
        /// Give up waiting after this many seconds; the jobs keep their state.
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    engage_observability::init();
    let cli = Cli::parse();
    let config = ApiConfig::from_env()?;

    match cli.command {
        Command::GenerateMonthly { tenant, month, division, wait_secs } => {
            let services = build_services(&config).await.context("failed to build services")?;
            let outcome = generate_monthly(&services, tenant, &month, division.map(DivisionId::new), wait_secs).await;
            tokio::task::spawn_blocking(move || services.shutdown()).await?;

            let batch = outcome?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            if !batch.is_completed() {
                anyhow::bail!("batch {} still running after {wait_secs}s", batch.batch_id);
            }
            Ok(())
        }
    }
}

async fn generate_monthly(
    services: &AppServices,
    tenant_id: TenantId,
    month: &str,
    division_id: Option<DivisionId>,
    wait_secs: u64,
) -> anyhow::Result<BatchReadModel> {
    let summary = services
        .start_monthly_run(tenant_id, month, division_id)
        .with_context(|| format!("failed to start the {month} run"))?;
    tracing::info!(
        batch_id = %summary.batch_id,
        jobs = summary.jobs_enqueued,
        duplicates = summary.duplicates,
        "monthly run started"
    );

    wait_for_batch(services, tenant_id, summary.batch_id, Duration::from_secs(wait_secs)).await
}

/// Poll the batch projection until the batch completes or `timeout` passes.
async fn wait_for_batch(
    services: &AppServices,
    tenant_id: TenantId,
    batch_id: BatchId,
    timeout: Duration,
) -> anyhow::Result<BatchReadModel> {
    let deadline = Instant::now() + timeout;
    loop {
        let batch = services.batch_get(tenant_id, &batch_id);
        match batch {
            Some(b) if b.is_completed() || Instant::now() >= deadline => return Ok(b),
            None if Instant::now() >= deadline => anyhow::bail!("batch {batch_id} was never projected"),
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}
